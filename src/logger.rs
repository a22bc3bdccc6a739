use tracing::{debug, trace};
use tracing_subscriber::EnvFilter;

use crate::peer::types::IceCandidate;

// Debug builds log verbosely; release builds stay at info.
#[cfg(debug_assertions)]
pub const DEFAULT_FILTER: &str = "voicecast_lib=debug,voicecast=debug,info";

#[cfg(not(debug_assertions))]
pub const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber. `RUST_LOG` wins over `filter`.
pub fn init(filter: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter.unwrap_or(DEFAULT_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}

/// Trickle-ICE trace of a candidate as it passes through
pub fn dump_candidate(session_id: &str, label: &str, cand: &IceCandidate) {
    trace!(
        session_id,
        label,
        candidate = %cand.candidate,
        sdp_mid = ?cand.sdp_mid,
        sdp_mline_index = ?cand.sdp_mline_index,
        "trickle"
    );
}

pub fn log_state(session_id: &str, from: impl std::fmt::Display, to: impl std::fmt::Display) {
    debug!(session_id, %from, %to, "session state transition");
}
