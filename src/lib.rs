//! Network interface health monitor.
//!
//! One invocation runs one cycle: probe every configured interface with real
//! TLS handshakes bound to that interface, optionally confirm the ISP behind
//! it, compare with the previous run's state and alert only on transitions.

pub mod alert;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod isp;
pub mod monitor;
pub mod net;
pub mod probe;
pub mod state;

pub use config::{Config, Features, Overrides, Toggle};
pub use error::Error;
pub use monitor::{CycleReport, Monitor};
