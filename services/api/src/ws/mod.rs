//! WebSocket Action Sessions
//!
//! - `protocol`: the JSON frames exchanged with the client.
//! - `session`: the connection lifecycle, from `init` through action dispatch to
//!   streaming display updates.

pub mod protocol;
pub mod session;

pub use session::ws_handler;
