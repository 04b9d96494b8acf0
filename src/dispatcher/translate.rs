//! Fanout config translation
//!
//! Pure mapping from a FanoutChannel to the routing entry the dispatcher
//! installs for it. Nothing here touches the cluster or the routing table, so
//! a translation failure never leaves a channel half-installed.

use std::time::Duration;

use kube::ResourceExt;
use reqwest::Url;

use super::fanout::{RetryPolicy, Subscription};
use crate::crd::{DeliverySpec, FanoutChannel, SubscriberSpec};
use crate::Error;

/// Routing entry for one channel
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelConfig {
    /// Channel namespace
    pub namespace: String,
    /// Channel name
    pub name: String,
    /// Hostname the ingress routes on
    pub host: String,
    /// Subscriptions in spec order
    pub subscriptions: Vec<Subscription>,
}

impl ChannelConfig {
    /// "namespace/name" key identifying the owning channel
    pub fn owner_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Translate a channel into its routing entry
///
/// Fails with `NotReady` if the channel has no address yet, and with
/// `Translation` if any subscriber record is malformed.
pub fn translate(channel: &FanoutChannel) -> Result<ChannelConfig, Error> {
    let name = channel.name_any();
    let host = channel
        .address_host()
        .ok_or_else(|| Error::not_ready("FanoutChannel", name.as_str(), "address is not assigned"))?;

    let subscriptions = channel
        .spec
        .subscribers
        .iter()
        .enumerate()
        .map(|(index, subscriber)| {
            subscription_from_spec(index, subscriber, channel.spec.delivery.as_ref())
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ChannelConfig {
        namespace: channel.namespace().unwrap_or_default(),
        name,
        host,
        subscriptions,
    })
}

/// Translate one subscriber record
///
/// A subscriber with neither a subscriber nor a reply URI is a translation
/// error. The subscriber's own delivery spec replaces the channel default
/// as a whole; fields missing from the chosen spec fall back to
/// [`RetryPolicy::standard`].
pub fn subscription_from_spec(
    index: usize,
    spec: &SubscriberSpec,
    channel_delivery: Option<&DeliverySpec>,
) -> Result<Subscription, Error> {
    let subscriber = parse_uri(index, "subscriberUri", spec.subscriber_uri.as_deref())?;
    let reply = parse_uri(index, "replyUri", spec.reply_uri.as_deref())?;
    if subscriber.is_none() && reply.is_none() {
        return Err(Error::translation(
            index,
            "neither subscriberUri nor replyUri is set",
        ));
    }
    let delivery = spec.delivery.as_ref().or(channel_delivery);
    let retry = retry_policy(index, delivery)?;

    Ok(Subscription {
        subscriber,
        reply,
        retry,
    })
}

fn parse_uri(index: usize, field: &str, uri: Option<&str>) -> Result<Option<Url>, Error> {
    match uri.map(str::trim).filter(|u| !u.is_empty()) {
        None => Ok(None),
        Some(raw) => Url::parse(raw)
            .map(Some)
            .map_err(|e| Error::translation(index, format!("invalid {field} {raw:?}: {e}"))),
    }
}

fn retry_policy(index: usize, delivery: Option<&DeliverySpec>) -> Result<RetryPolicy, Error> {
    let standard = RetryPolicy::standard();
    let Some(delivery) = delivery else {
        return Ok(standard);
    };

    let retry_max = match delivery.retry {
        None => standard.retry_max,
        Some(n) => u32::try_from(n)
            .map_err(|_| Error::translation(index, format!("retry must not be negative, got {n}")))?,
    };
    let backoff_policy = delivery.backoff_policy.unwrap_or(standard.backoff_policy);
    let backoff_delay = match delivery.backoff_delay.as_deref() {
        None => standard.backoff_delay,
        Some(raw) => parse_duration(raw).map_err(|e| {
            Error::translation(index, format!("invalid backoffDelay {raw:?}: {e}"))
        })?,
    };

    Ok(RetryPolicy::new(retry_max, backoff_policy, backoff_delay))
}

/// Parse an ISO-8601 duration such as `PT0.2S`, `PT1M30S` or `P1DT2H`
///
/// Weeks, days, hours, minutes and (fractional) seconds are accepted. Years
/// and months have no fixed length and are rejected.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let rest = raw
        .strip_prefix('P')
        .ok_or_else(|| "duration must start with 'P'".to_string())?;
    if rest.is_empty() {
        return Err("duration has no components".to_string());
    }

    let (date, time) = match rest.split_once('T') {
        Some((_, "")) => return Err("'T' must be followed by a time component".to_string()),
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };

    let mut total = 0f64;
    for (value, unit) in components(date)? {
        total += value
            * match unit {
                'W' => 7.0 * 86_400.0,
                'D' => 86_400.0,
                'Y' | 'M' => return Err(format!("unit '{unit}' has no fixed length")),
                other => return Err(format!("unknown date unit '{other}'")),
            };
    }
    for (value, unit) in components(time.unwrap_or_default())? {
        total += value
            * match unit {
                'H' => 3_600.0,
                'M' => 60.0,
                'S' => 1.0,
                other => return Err(format!("unknown time unit '{other}'")),
            };
    }

    Duration::try_from_secs_f64(total).map_err(|e| e.to_string())
}

fn components(part: &str) -> Result<Vec<(f64, char)>, String> {
    let mut out = Vec::new();
    let mut number = String::new();
    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' || c == ',' {
            number.push(if c == ',' { '.' } else { c });
            continue;
        }
        if number.is_empty() {
            return Err(format!("unit '{c}' has no value"));
        }
        let value = number
            .parse::<f64>()
            .map_err(|_| format!("invalid number {number:?}"))?;
        out.push((value, c));
        number.clear();
    }
    if !number.is_empty() {
        return Err(format!("value {number:?} has no unit"));
    }
    Ok(out)
}
