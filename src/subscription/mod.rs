//! Subscription multiplexing over a WS transport (C5).

pub mod multiplexer;
pub mod types;

pub use multiplexer::SubscriptionMultiplexer;
pub use types::{
    Subscription, SubscriptionKind, SubscriptionPayload, SubscriptionSnapshot, SubscriptionStatus,
};
