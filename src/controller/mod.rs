//! Channel controller
//!
//! Reconciles FanoutChannels against the shared dispatcher infrastructure and
//! owns each channel's ExternalName Service.

mod channel;
pub mod resources;
mod runner;

pub use channel::{
    error_policy, reconcile, ChannelStore, ChannelStoreImpl, Context, ContextBuilder,
};
pub use runner::{
    dispatcher_resync_trigger, log_reconcile_result, run_channel_controller, WATCH_TIMEOUT_SECS,
};
