//! Session layer of the multiplexed exec stream protocol.
//!
//! Provides:
//! - `Multiplexer` - Frames process streams onto one transport
//! - `SessionController` - Drives a session to its terminal state
//! - `SessionRegistry` - Tracks live sessions of a server

pub mod controller;
pub mod mux;
pub mod registry;
pub mod state;

pub use controller::{SessionController, SessionHandle};
pub use mux::{FlowView, FlowWatch, MuxEvent, Multiplexer};
pub use registry::SessionRegistry;
pub use state::{Role, SessionState};
