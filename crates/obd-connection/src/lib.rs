//! Device Connection Management
//!
//! Owns the lifecycle of one diagnostic device: connect with retry and
//! backoff, adapter initialization, reconnect after link loss, periodic
//! health checks and persistence of every state change.

mod clock;
mod config;
mod events;
mod manager;
mod retry;
mod state;

pub use clock::{Clock, RecordingClock, TokioClock};
pub use config::ManagerConfig;
pub use events::ConnectionEvent;
pub use manager::{ConnectionManager, ConnectionManagerBuilder, ConnectionSnapshot};
pub use retry::RetryPolicy;
pub use state::{ConnectionState, Transition};
