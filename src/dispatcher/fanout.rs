//! Fan-out delivery
//!
//! A [`FanoutHandler`] owns the installed subscriptions of one channel and
//! delivers each inbound message to all of them concurrently. The list is
//! held in an `ArcSwap` so the HTTP hot path reads it without locking while
//! the reconciler swaps in a new list.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use reqwest::header::{HeaderMap, HeaderName, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::BackoffPolicy;
use crate::Error;

/// Delay used when backoff arithmetic overflows (1 day)
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Computes the delay before retry `n` (1-based)
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// How a subscription retries failed deliveries
///
/// Equality compares the declared parameters only; the backoff closure is
/// derived from them and cannot be compared.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt
    pub retry_max: u32,
    /// Shape of the backoff
    pub backoff_policy: BackoffPolicy,
    /// Base delay
    pub backoff_delay: Duration,
    /// Delay before retry n
    pub backoff: BackoffFn,
}

impl RetryPolicy {
    /// Build a policy and its backoff closure
    pub fn new(retry_max: u32, backoff_policy: BackoffPolicy, backoff_delay: Duration) -> Self {
        let backoff: BackoffFn = match backoff_policy {
            BackoffPolicy::Linear => Arc::new(move |attempt| {
                backoff_delay
                    .checked_mul(attempt.max(1))
                    .unwrap_or(MAX_BACKOFF)
                    .min(MAX_BACKOFF)
            }),
            BackoffPolicy::Exponential => Arc::new(move |attempt| {
                let exponent = attempt.max(1) - 1;
                2u32.checked_pow(exponent)
                    .and_then(|factor| backoff_delay.checked_mul(factor))
                    .unwrap_or(MAX_BACKOFF)
                    .min(MAX_BACKOFF)
            }),
        };
        Self {
            retry_max,
            backoff_policy,
            backoff_delay,
            backoff,
        }
    }

    /// Policy used when neither the subscriber nor the channel says otherwise:
    /// 3 retries, exponential from 200ms
    pub fn standard() -> Self {
        Self::new(3, BackoffPolicy::Exponential, Duration::from_millis(200))
    }

    /// Delay before retry `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        (self.backoff)(attempt)
    }
}

impl PartialEq for RetryPolicy {
    fn eq(&self, other: &Self) -> bool {
        self.retry_max == other.retry_max
            && self.backoff_policy == other.backoff_policy
            && self.backoff_delay == other.backoff_delay
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retry_max", &self.retry_max)
            .field("backoff_policy", &self.backoff_policy)
            .field("backoff_delay", &self.backoff_delay)
            .finish_non_exhaustive()
    }
}

/// One installed destination of a channel
#[derive(Clone, Debug, PartialEq)]
pub struct Subscription {
    /// Receives every message
    pub subscriber: Option<Url>,
    /// Receives the subscriber's response (or the message, without a subscriber)
    pub reply: Option<Url>,
    /// Retry behavior for both hops
    pub retry: RetryPolicy,
}

/// An HTTP message in transit: forwarded headers plus body
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    /// Headers carried to the destination
    pub headers: HeaderMap,
    /// Raw body
    pub body: Bytes,
}

impl Message {
    /// Build a message keeping only the headers worth forwarding
    ///
    /// Content-Type and CloudEvents binary-mode headers (`ce-*`) travel with
    /// the message; hop-by-hop and routing headers (Host, Content-Length,
    /// Connection, ...) do not.
    pub fn new(headers: &HeaderMap, body: Bytes) -> Self {
        let forwarded = headers
            .iter()
            .filter(|(name, _)| is_forwarded(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Self {
            headers: forwarded,
            body,
        }
    }
}

fn is_forwarded(name: &HeaderName) -> bool {
    name == CONTENT_TYPE || name.as_str().starts_with("ce-")
}

/// Sends a message to one destination
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// POST `message` to `destination`
    ///
    /// Returns the destination's response as a message when it answered with
    /// a non-empty body, `None` otherwise. Non-2xx responses are errors;
    /// only 5xx, 408 and 429 are worth retrying.
    async fn send(&self, destination: &Url, message: &Message) -> Result<Option<Message>, Error>;
}

/// Real HTTP sender backed by reqwest
pub struct HttpMessageSender {
    client: reqwest::Client,
}

impl HttpMessageSender {
    /// Create a sender whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MessageSender for HttpMessageSender {
    async fn send(&self, destination: &Url, message: &Message) -> Result<Option<Message>, Error> {
        let response = self
            .client
            .post(destination.clone())
            .headers(message.headers.clone())
            .body(message.body.clone())
            .send()
            .await
            .map_err(|e| Error::dispatch(destination.as_str(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("unexpected status {status}");
            return Err(if is_retryable_status(status) {
                Error::dispatch(destination.as_str(), message)
            } else {
                Error::rejected(destination.as_str(), message)
            });
        }

        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::dispatch(destination.as_str(), e.to_string()))?;

        if body.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Message::new(&headers, body)))
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Delivers messages to the installed subscriptions of one channel
pub struct FanoutHandler {
    owner: String,
    subscriptions: ArcSwap<Vec<Subscription>>,
    sender: Arc<dyn MessageSender>,
}

impl FanoutHandler {
    /// Create a handler for the channel `owner` ("namespace/name")
    pub fn new(
        owner: impl Into<String>,
        subscriptions: Vec<Subscription>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            owner: owner.into(),
            subscriptions: ArcSwap::from_pointee(subscriptions),
            sender,
        }
    }

    /// Channel this handler serves ("namespace/name")
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Snapshot of the installed subscriptions
    pub fn subscriptions(&self) -> Arc<Vec<Subscription>> {
        self.subscriptions.load_full()
    }

    /// Atomically replace the installed subscriptions
    ///
    /// Dispatches already running keep the list they started with.
    pub fn set_subscriptions(&self, subscriptions: Vec<Subscription>) {
        self.subscriptions.store(Arc::new(subscriptions));
    }

    /// Deliver `message` to every subscription concurrently
    ///
    /// Returns one result per subscription, in installation order.
    pub async fn dispatch(&self, message: &Message) -> Vec<Result<(), Error>> {
        let subscriptions = self.subscriptions();
        join_all(
            subscriptions
                .iter()
                .map(|subscription| self.dispatch_one(subscription, message)),
        )
        .await
    }

    async fn dispatch_one(&self, subscription: &Subscription, message: &Message) -> Result<(), Error> {
        match (&subscription.subscriber, &subscription.reply) {
            (Some(subscriber), reply) => {
                let response = self
                    .send_with_retry(subscriber, message, &subscription.retry)
                    .await?;
                if let (Some(reply), Some(response)) = (reply, response) {
                    self.send_with_retry(reply, &response, &subscription.retry)
                        .await?;
                }
                Ok(())
            }
            (None, Some(reply)) => self
                .send_with_retry(reply, message, &subscription.retry)
                .await
                .map(|_| ()),
            (None, None) => Err(Error::rejected(
                self.owner.as_str(),
                "subscription has no subscriber or reply destination",
            )),
        }
    }

    async fn send_with_retry(
        &self,
        destination: &Url,
        message: &Message,
        policy: &RetryPolicy,
    ) -> Result<Option<Message>, Error> {
        let mut attempt = 0u32;
        loop {
            match self.sender.send(destination, message).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < policy.retry_max && e.is_retryable() => {
                    attempt += 1;
                    let delay = policy.delay(attempt);
                    debug!(
                        channel = %self.owner,
                        destination = %destination,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        channel = %self.owner,
                        destination = %destination,
                        attempts = attempt + 1,
                        error = %e,
                        "delivery failed"
                    );
                    return Err(e);
                }
            }
        }
    }
}

impl fmt::Debug for FanoutHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutHandler")
            .field("owner", &self.owner)
            .field("subscriptions", &self.subscriptions.load().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn message(body: &'static str) -> Message {
        Message {
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    fn subscription(subscriber: Option<&str>, reply: Option<&str>) -> Subscription {
        Subscription {
            subscriber: subscriber.map(url),
            reply: reply.map(url),
            retry: RetryPolicy::new(2, BackoffPolicy::Linear, Duration::from_millis(10)),
        }
    }

    #[test]
    fn linear_and_exponential_backoff_shapes() {
        let linear = RetryPolicy::new(5, BackoffPolicy::Linear, Duration::from_millis(100));
        assert_eq!(linear.delay(1), Duration::from_millis(100));
        assert_eq!(linear.delay(3), Duration::from_millis(300));

        let exp = RetryPolicy::new(5, BackoffPolicy::Exponential, Duration::from_millis(100));
        assert_eq!(exp.delay(1), Duration::from_millis(100));
        assert_eq!(exp.delay(2), Duration::from_millis(200));
        assert_eq!(exp.delay(4), Duration::from_millis(800));
        assert_eq!(exp.delay(200), MAX_BACKOFF);
    }

    /// Story: two policies built separately are equal even though their closures differ
    #[test]
    fn story_retry_policy_equality_ignores_closure() {
        let a = RetryPolicy::standard();
        let mut b = RetryPolicy::standard();
        b.backoff = Arc::new(|_| Duration::from_secs(42));
        assert_eq!(a, b);
        assert_ne!(
            a,
            RetryPolicy::new(3, BackoffPolicy::Linear, Duration::from_millis(200))
        );
    }

    #[test]
    fn message_keeps_only_forwardable_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "orders-fanout-ch.default.svc".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("ce-id", "1234".parse().unwrap());
        headers.insert("content-length", "2".parse().unwrap());

        let msg = Message::new(&headers, Bytes::from_static(b"{}"));
        assert_eq!(msg.headers.len(), 2);
        assert!(msg.headers.contains_key("content-type"));
        assert!(msg.headers.contains_key("ce-id"));
    }

    /// Story: every subscriber gets the message
    #[tokio::test]
    async fn story_message_reaches_every_subscriber() {
        let mut sender = MockMessageSender::new();
        sender
            .expect_send()
            .withf(|dest, msg| dest.host_str() == Some("a.svc") && msg.body == "hello")
            .times(1)
            .returning(|_, _| Ok(None));
        sender
            .expect_send()
            .withf(|dest, msg| dest.host_str() == Some("b.svc") && msg.body == "hello")
            .times(1)
            .returning(|_, _| Ok(None));

        let handler = FanoutHandler::new(
            "default/orders",
            vec![
                subscription(Some("http://a.svc/"), None),
                subscription(Some("http://b.svc/"), None),
            ],
            Arc::new(sender),
        );

        let results = handler.dispatch(&message("hello")).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(Result::is_ok));
    }

    /// Story: a subscriber's response is forwarded to the reply destination
    #[tokio::test]
    async fn story_subscriber_response_forwarded_to_reply() {
        let mut sender = MockMessageSender::new();
        sender
            .expect_send()
            .withf(|dest, _| dest.host_str() == Some("transform.svc"))
            .times(1)
            .returning(|_, _| Ok(Some(message("transformed"))));
        sender
            .expect_send()
            .withf(|dest, msg| dest.host_str() == Some("sink.svc") && msg.body == "transformed")
            .times(1)
            .returning(|_, _| Ok(None));

        let handler = FanoutHandler::new(
            "default/orders",
            vec![subscription(
                Some("http://transform.svc/"),
                Some("http://sink.svc/"),
            )],
            Arc::new(sender),
        );

        let results = handler.dispatch(&message("raw")).await;
        assert!(results[0].is_ok());
    }

    /// Story: a reply-only subscription receives the original message
    #[tokio::test]
    async fn story_reply_only_receives_original() {
        let mut sender = MockMessageSender::new();
        sender
            .expect_send()
            .withf(|dest, msg| dest.host_str() == Some("sink.svc") && msg.body == "raw")
            .times(1)
            .returning(|_, _| Ok(None));

        let handler = FanoutHandler::new(
            "default/orders",
            vec![subscription(None, Some("http://sink.svc/"))],
            Arc::new(sender),
        );

        assert!(handler.dispatch(&message("raw")).await[0].is_ok());
    }

    /// Story: transient failures are retried up to the policy limit
    #[tokio::test(start_paused = true)]
    async fn story_failed_delivery_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut sender = MockMessageSender::new();
        sender.expect_send().returning(move |dest, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::dispatch(dest.as_str(), "unexpected status 503"))
            } else {
                Ok(None)
            }
        });

        let handler = FanoutHandler::new(
            "default/orders",
            vec![subscription(Some("http://flaky.svc/"), None)],
            Arc::new(sender),
        );

        assert!(handler.dispatch(&message("x")).await[0].is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    /// Story: one failing subscriber doesn't hide the others' success
    #[tokio::test(start_paused = true)]
    async fn story_failures_reported_per_subscription() {
        let mut sender = MockMessageSender::new();
        sender.expect_send().returning(|dest, _| {
            if dest.host_str() == Some("down.svc") {
                Err(Error::dispatch(dest.as_str(), "connection refused"))
            } else {
                Ok(None)
            }
        });

        let handler = FanoutHandler::new(
            "default/orders",
            vec![
                subscription(Some("http://up.svc/"), None),
                subscription(Some("http://down.svc/"), None),
            ],
            Arc::new(sender),
        );

        let results = handler.dispatch(&message("x")).await;
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::Dispatch { .. })));
    }

    /// Story: a subscriber that rejects the message is not asked again
    #[tokio::test(start_paused = true)]
    async fn story_rejected_delivery_is_not_retried() {
        let mut sender = MockMessageSender::new();
        sender
            .expect_send()
            .times(1)
            .returning(|dest, _| Err(Error::rejected(dest.as_str(), "unexpected status 404")));

        let handler = FanoutHandler::new(
            "default/orders",
            vec![subscription(Some("http://gone.svc/"), None)],
            Arc::new(sender),
        );

        let results = handler.dispatch(&message("x")).await;
        assert!(matches!(
            results[0],
            Err(Error::Dispatch { retryable: false, .. })
        ));
    }

    #[test]
    fn only_server_errors_timeouts_and_throttling_are_retryable() {
        for status in [500u16, 502, 503, 408, 429] {
            assert!(is_retryable_status(StatusCode::from_u16(status).unwrap()));
        }
        for status in [400u16, 401, 404, 413, 422] {
            assert!(!is_retryable_status(StatusCode::from_u16(status).unwrap()));
        }
    }

    /// Story: a subscription without any destination fails instead of dropping the message
    #[tokio::test]
    async fn story_destinationless_subscription_fails() {
        let mut sender = MockMessageSender::new();
        sender.expect_send().times(0);

        let handler = FanoutHandler::new(
            "default/orders",
            vec![subscription(None, None)],
            Arc::new(sender),
        );

        let results = handler.dispatch(&message("x")).await;
        assert!(matches!(results[0], Err(Error::Dispatch { .. })));
    }

    #[test]
    fn set_subscriptions_swaps_snapshot() {
        let handler = FanoutHandler::new(
            "default/orders",
            vec![subscription(Some("http://a.svc/"), None)],
            Arc::new(MockMessageSender::new()),
        );
        let before = handler.subscriptions();

        handler.set_subscriptions(vec![subscription(Some("http://c.svc/"), None)]);
        let after = handler.subscriptions();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before[0].subscriber.as_ref().unwrap().host_str(), Some("a.svc"));
        assert_eq!(after[0].subscriber.as_ref().unwrap().host_str(), Some("c.svc"));
    }
}
