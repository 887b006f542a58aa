//! Per-connection buffer for trickled ICE candidates.
//!
//! Candidates may arrive before the remote description they belong to has
//! been applied. They wait here and are replayed, in arrival order, once it
//! has been.

use crate::media::PeerConnection;
use relayhub_protocol::IceCandidateData;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidateData>,
    remote_description_set: bool,
}

/// Outcome of replaying queued candidates
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub failed: usize,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `candidate` until the remote description is set.
    ///
    /// Once it is set nothing is buffered: the candidate is handed back and
    /// must be applied right away.
    pub fn enqueue(&mut self, candidate: IceCandidateData) -> Option<IceCandidateData> {
        if self.remote_description_set {
            return Some(candidate);
        }
        self.pending.push_back(candidate);
        None
    }

    /// Record that the remote description is set and replay every buffered
    /// candidate, oldest first. Each application completes before the next
    /// starts; a failing candidate is logged and skipped.
    pub async fn flush(&mut self, connection: &dyn PeerConnection) -> FlushReport {
        self.remote_description_set = true;

        let mut report = FlushReport::default();
        while let Some(candidate) = self.pending.pop_front() {
            match connection.add_ice_candidate(candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    tracing::warn!("Dropping queued ICE candidate: {}", e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Discard everything buffered; used when the connection closes
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
