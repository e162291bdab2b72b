//! Socket Strategy
//!
//! One long-lived websocket session per provider run, with a heartbeat timer
//! running beside the receive loop.

mod heartbeat;
mod session;

pub use heartbeat::{HeartbeatTick, HeartbeatTimer};
pub use session::{SessionState, SocketSessionHandler};
