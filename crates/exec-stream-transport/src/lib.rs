//! WebSocket transports for exec stream sessions.
//!
//! Provides:
//! - `/shell.sock` exec endpoint for axum servers (feature: websocket)
//! - Dialing client for the controlling side (feature: client)

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "websocket")]
pub use websocket::{ExecLauncher, ExecRequest, ExecState, create_exec_router};

#[cfg(feature = "client")]
pub use client::{DialError, dial, dial_url};
