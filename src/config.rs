//! Process configuration for the controller and dispatcher
//!
//! Both are parsed with clap and fall back to environment variables, which is
//! how the Deployments inject them.

use std::time::Duration;

use clap::Args;

use crate::{
    Error, DEFAULT_CLUSTER_DOMAIN, DEFAULT_DISPATCHER_PORT, DEFAULT_DISPATCH_TIMEOUT_SECS,
    DEFAULT_SYSTEM_NAMESPACE,
};

/// Channel controller settings
#[derive(Args, Clone, Debug)]
pub struct ControllerConfig {
    /// Image of the shared dispatcher Deployment
    #[arg(long, env = "DISPATCHER_IMAGE")]
    pub dispatcher_image: Option<String>,

    /// Namespace holding the shared dispatcher
    #[arg(long, env = "SYSTEM_NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    pub system_namespace: String,

    /// Cluster DNS domain used to build channel addresses
    #[arg(long, env = "CLUSTER_DOMAIN", default_value = DEFAULT_CLUSTER_DOMAIN)]
    pub cluster_domain: String,
}

impl ControllerConfig {
    /// Reject configurations the controller cannot start with
    pub fn validate(&self) -> Result<(), Error> {
        match self.dispatcher_image.as_deref() {
            None | Some("") => {
                return Err(Error::config(
                    "DISPATCHER_IMAGE must be set to the dispatcher image reference",
                ))
            }
            Some(_) => {}
        }
        if self.system_namespace.is_empty() {
            return Err(Error::config("system namespace must not be empty"));
        }
        if self.cluster_domain.is_empty() {
            return Err(Error::config("cluster domain must not be empty"));
        }
        Ok(())
    }
}

/// Dispatcher settings
#[derive(Args, Clone, Debug)]
pub struct DispatcherConfig {
    /// Name of this pod (leader election identity)
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Name of this container (leader election identity)
    #[arg(long, env = "CONTAINER_NAME")]
    pub container_name: Option<String>,

    /// Namespace holding the leader election Lease
    #[arg(long, env = "SYSTEM_NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    pub system_namespace: String,

    /// Port for the HTTP ingress
    #[arg(long, env = "DISPATCHER_PORT", default_value_t = DEFAULT_DISPATCHER_PORT)]
    pub port: u16,

    /// Request read timeout in seconds
    #[arg(long, default_value_t = DEFAULT_DISPATCH_TIMEOUT_SECS)]
    pub read_timeout_secs: u64,

    /// Response write timeout in seconds (also bounds shutdown drain)
    #[arg(long, default_value_t = DEFAULT_DISPATCH_TIMEOUT_SECS)]
    pub write_timeout_secs: u64,
}

impl DispatcherConfig {
    /// Reject configurations the dispatcher cannot start with
    pub fn validate(&self) -> Result<(), Error> {
        if self.pod_name.as_deref().unwrap_or_default().is_empty() {
            return Err(Error::config("POD_NAME must be set"));
        }
        if self.container_name.as_deref().unwrap_or_default().is_empty() {
            return Err(Error::config("CONTAINER_NAME must be set"));
        }
        Ok(())
    }

    /// Leader election identity: `<pod>/<container>`
    pub fn identity(&self) -> Result<String, Error> {
        self.validate()?;
        Ok(format!(
            "{}/{}",
            self.pod_name.as_deref().unwrap_or_default(),
            self.container_name.as_deref().unwrap_or_default()
        ))
    }

    /// Read timeout as a Duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Write timeout as a Duration
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}
