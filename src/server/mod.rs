//! Multi-client session handling
//!
//! - **mux**: the readiness loop coupling the device lifecycle to the
//!   client count and routing traffic both ways
//! - **session**: per-client state and the reader task
//! - **board**: the pluggable board-name hook

pub mod board;
pub mod mux;
pub mod session;

pub use board::{BoardName, NoBoardName};
pub use mux::{Exit, Server};
pub use session::{ClientEvent, ClientId, ClientSession};
