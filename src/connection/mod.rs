//! Client Connection Layer
//!
//! Transport-agnostic connection tracking with channel fan-out and
//! heartbeat supervision, plus the WebSocket front that feeds it.

pub mod envelope;
pub mod manager;
pub mod ws;

pub use envelope::Envelope;
pub use manager::{ClientHandle, ConnectionManager, ConnectionStats, UserConnectionStats};
pub use ws::WsClientHandle;
