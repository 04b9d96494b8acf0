//! Fanout channel - Kubernetes control plane for HTTP fan-out channels
//!
//! A `FanoutChannel` is a named HTTP endpoint that delivers every inbound
//! message to each of its subscribers. Two processes cooperate:
//!
//! - the **controller** makes sure the shared dispatcher is healthy, gives each
//!   channel an ExternalName Service and an address, and rolls dependent
//!   conditions up into `Ready`
//! - the **dispatcher** keeps a hostname-keyed routing table in sync with ready
//!   channels, serves the HTTP ingress, and reports subscriber readiness
//!
//! # Modules
//!
//! - [`crd`] - The FanoutChannel custom resource and its status types
//! - [`conditions`] - Condition tracking and the Ready roll-up
//! - [`controller`] - Channel controller (dependent infrastructure, channel Service)
//! - [`dispatcher`] - Translation, routing table, reconciler and HTTP ingress
//! - [`leader`] - Lease-based leader election for dispatcher replicas
//! - [`events`] - Kubernetes Event publishing
//! - [`retry`] - Backoff helpers
//! - [`config`] - Process configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod conditions;
pub mod config;
pub mod controller;
pub mod crd;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod leader;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Name shared by the dispatcher Deployment, Service and Endpoints
pub const DISPATCHER_NAME: &str = "fanout-ch-dispatcher";

/// Namespace holding the shared dispatcher
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "fanout-system";

/// Cluster DNS domain used in channel addresses
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Port the dispatcher ingress listens on
pub const DEFAULT_DISPATCHER_PORT: u16 = 8080;

/// Dispatcher read and write timeout (15 minutes) for long-lived requests
pub const DEFAULT_DISPATCH_TIMEOUT_SECS: u64 = 15 * 60;

/// Largest message body the ingress accepts (10 MiB)
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// Lease used to elect the dispatcher replica that writes channel status
pub const DISPATCHER_LEASE_NAME: &str = "fanout-ch-dispatcher-leader";

/// Field manager / event reporter name of the channel controller
pub const CONTROLLER_NAME: &str = "fanout-channel-controller";

/// Field manager / event reporter name of the dispatcher
pub const DISPATCHER_COMPONENT: &str = "fanout-channel-dispatcher";
