//! Custom Resource Definitions for fanout channels

mod channel;
mod types;

pub use channel::{FanoutChannel, FanoutChannelSpec, FanoutChannelStatus};
pub use types::{
    BackoffPolicy, ChannelAddress, Condition, ConditionStatus, DeliverySpec, SubscriberSpec,
    SubscriberStatus,
};
