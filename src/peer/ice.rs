use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::error::CandidateError;
use crate::logger::dump_candidate;
use crate::peer::connection::Transport;
use crate::peer::types::IceCandidate;

/// Remote candidates received before the remote description was applied.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
    remote_description_set: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `candidate` if the remote description is still missing,
    /// otherwise hands it back to be applied right away.
    pub fn admit(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Marks the remote description as applied and drains the queue in
    /// arrival order. Only the first call returns anything.
    pub fn remote_description_applied(&mut self) -> Vec<IceCandidate> {
        if self.remote_description_set {
            return Vec::new();
        }
        self.remote_description_set = true;
        self.pending.drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Applies one remote candidate; a rejection never takes the session down.
pub async fn apply_candidate(
    session_id: &str,
    transport: &dyn Transport,
    candidate: IceCandidate,
) -> Result<(), CandidateError> {
    dump_candidate(session_id, "REMOTE", &candidate);
    let raw = candidate.candidate.clone();
    match transport.add_ice_candidate(candidate).await {
        Ok(()) => {
            debug!(session_id, "remote candidate applied");
            Ok(())
        }
        Err(source) => {
            let err = CandidateError {
                candidate: raw,
                source,
            };
            warn!(session_id, error = %err, "dropping remote candidate");
            Err(err)
        }
    }
}

/// Applies the candidates released by [`CandidateBuffer::remote_description_applied`].
pub async fn apply_pending_candidates(
    session_id: &str,
    transport: &dyn Transport,
    candidates: Vec<IceCandidate>,
) -> usize {
    let total = candidates.len();
    let mut applied = 0;
    for candidate in candidates {
        if apply_candidate(session_id, transport, candidate).await.is_ok() {
            applied += 1;
        }
    }
    if total > 0 {
        debug!(session_id, applied, total, "flushed buffered remote candidates");
    }
    applied
}

pub fn analyze_candidates(session_id: &str, candidates: &[IceCandidate]) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            host_count += 1;
        } else if candidate.candidate.contains("typ srflx") {
            srflx_count += 1;
        } else if candidate.candidate.contains("typ relay") {
            relay_count += 1;
        }
    }

    debug!(
        session_id,
        host_count, srflx_count, relay_count, "local candidate summary"
    );

    if relay_count == 0 && srflx_count == 0 && host_count > 0 {
        warn!(
            session_id,
            "only host candidates gathered, peers behind NAT may not connect"
        );
    }
}
