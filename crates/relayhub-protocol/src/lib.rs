//! Signaling protocol for the relay hub
//!
//! Every message travels as a JSON object whose `type` field names the event,
//! e.g. `{"type": "offer", "sdp": "..."}`.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
