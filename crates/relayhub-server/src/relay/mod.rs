//! Relay session manager
//!
//! One producer connection feeds the hub; every consumer gets its own
//! outbound connection carrying the producer's current live video track.

pub mod candidates;
mod hub;
pub mod liveness;
pub mod session;

pub use candidates::CandidateQueue;
pub use hub::{Dispatch, HubEvent, HubSettings, RelayHub};
pub use liveness::{LivenessMonitor, LivenessSettings, MonitorAction, MonitorState};
pub use session::{ConsumerSession, PeerSession, ProducerSession, SessionId};
