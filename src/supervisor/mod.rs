//! Supervisor Layer for System Monitoring
//!
//! Fault reporting for the coordination core:
//! - Alert manager with rate limiting and store persistence

pub mod alerts;

pub use alerts::{Alert, AlertManager, AlertOutcome, AlertSeverity, AlertStats, AlertType};
