//! Jambox Core Library
//!
//! Rule compilation and request disposition for a local development proxy:
//! config-driven cache replay, host forwarding and stubbing on top of an
//! intercepting HTTP/HTTPS proxy, with a live event feed for observers.

pub mod admin;
pub mod ca;
pub mod cache;
pub mod engine;
pub mod events;
pub mod exchange;
pub mod filter;
pub mod handlers;
/// Core proxy functionality modules
pub mod proxy;
pub mod rules;
pub mod upstream;

/// Configuration types and utilities
pub mod config;

/// Error types for proxy operations
pub mod error;

pub use admin::{AdminState, Metrics};
pub use ca::CertificateAuthority;
pub use cache::{Cache, CacheKey, EntryState};
pub use config::{JamboxConfig, ProxyStartupConfig};
pub use engine::{InterceptionEngine, LifecycleEvent, LifecycleListener, RuleEngine};
pub use error::JamboxError;
pub use events::{BroadcastEvent, Broadcaster, EventRecorder};
pub use exchange::{AbortedRequest, CompletedResponse, InterceptedRequest};
pub use handlers::InterceptHandler;
pub use proxy::ProxyServer;

/// Result type alias for jambox operations
pub type Result<T> = std::result::Result<T, JamboxError>;
