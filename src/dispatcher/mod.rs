//! Dispatcher: routing table, its reconciler and the HTTP ingress
//!
//! Every replica runs all three. The reconciler keeps the routing table in
//! sync with ready channels, the ingress serves traffic from it, and the
//! Lease decides which replica writes subscriber status.

pub mod fanout;
pub mod reconciler;
pub mod server;
pub mod table;
pub mod translate;

use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use fanout::{FanoutHandler, HttpMessageSender, Message, MessageSender, RetryPolicy, Subscription};
pub use reconciler::{
    run_dispatcher_reconciler, DispatcherContext, DispatcherStore, DispatcherStoreImpl,
    ReconcileKind,
};
pub use server::{router, run_ingress, IngressState};
pub use table::RoutingTable;
pub use translate::{translate, ChannelConfig};

use crate::config::DispatcherConfig;
use crate::events::KubeEventPublisher;
use crate::leader::LeaderElector;
use crate::{Error, DISPATCHER_COMPONENT, DISPATCHER_LEASE_NAME, MAX_MESSAGE_BYTES};

/// Run the dispatcher until a shutdown signal arrives
///
/// The ingress keeps draining in-flight requests for up to the write timeout
/// after the reconciler has stopped.
pub async fn run_dispatcher(client: Client, config: DispatcherConfig) -> Result<(), Error> {
    let identity = config.identity()?;
    let table = Arc::new(RoutingTable::new());
    let sender: Arc<dyn MessageSender> = Arc::new(HttpMessageSender::new(config.write_timeout())?);

    let elector = Arc::new(LeaderElector::new(
        client.clone(),
        DISPATCHER_LEASE_NAME,
        &config.system_namespace,
        &identity,
    ));
    let ctx = Arc::new(DispatcherContext::new(
        Arc::clone(&table),
        Arc::new(DispatcherStoreImpl::new(client.clone())),
        sender,
        Arc::new(KubeEventPublisher::new(client.clone(), DISPATCHER_COMPONENT)),
        elector.flag(),
    ));

    let shutdown = CancellationToken::new();
    let election = tokio::spawn(Arc::clone(&elector).run(shutdown.clone()));
    let mut ingress = tokio::spawn(run_ingress(
        config.port,
        IngressState {
            table,
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            max_body_bytes: MAX_MESSAGE_BYTES,
        },
        shutdown.clone(),
    ));

    info!(identity = %identity, port = config.port, "dispatcher started");

    let ingress_exit = tokio::select! {
        _ = run_dispatcher_reconciler(client, ctx) => None,
        exit = &mut ingress => Some(exit),
    };
    shutdown.cancel();
    let result = match ingress_exit {
        Some(exit) => join_ingress(exit),
        None => join_ingress(ingress.await),
    };

    if let Err(e) = election.await {
        warn!(error = %e, "leader election task failed");
    }
    info!("dispatcher stopped");
    result
}

fn join_ingress(result: Result<Result<(), Error>, tokio::task::JoinError>) -> Result<(), Error> {
    result.map_err(|e| Error::internal(format!("ingress task failed: {e}")))?
}
