//! # knight-session
//!
//! Keeps one WhatsApp-Web session alive: resolves the service through a
//! resolver failover list, persists credentials encrypted at rest, drives
//! reconnection with capped backoff, and dispatches inbound events to handlers.

pub mod credentials;
pub mod dispatcher;
pub mod lifecycle;
pub mod qr;
pub mod resolver;
pub mod ws;

pub use credentials::{CredentialKey, CredentialStore, SessionInfo};
pub use dispatcher::Dispatcher;
pub use lifecycle::{
    shutdown_channel, LifecycleConfig, LifecycleManager, Outcome, Phase, RetryPolicy,
    ShutdownSignal, ShutdownTrigger, StateHandle,
};
pub use resolver::Resolver;
pub use ws::WsClient;
