//! Execution runtime: session lifecycle and event fan-out.

pub mod broadcast;
pub mod manager;

pub use broadcast::{EventBroadcaster, Subscription};
pub use manager::{
    http_provider_factory, CancelStatus, ProviderFactory, Session, SessionLimits, SessionManager,
};
