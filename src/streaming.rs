//! Data-channel streaming of synthesized audio.
//!
//! Wire framing: the payload is split into binary messages of at most
//! `frame_size` bytes, followed by one text message `END`. A failed request
//! gets a single text message `ERROR: <reason>` instead. Receivers rely on
//! message boundaries, not on the frame size.

use bytes::Bytes;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamSection;
use crate::error::{QueueError, SynthesisError};
use crate::peer::data_channel::DataChannel;
use crate::synthesis::SynthesisGateway;

pub const END_SENTINEL: &str = "END";

pub fn error_sentinel(reason: impl std::fmt::Display) -> String {
    format!("ERROR: {reason}")
}

/// Splits `payload` into `ceil(len / frame_size)` zero-copy frames.
pub fn split_frames(payload: &Bytes, frame_size: NonZeroUsize) -> impl Iterator<Item = Bytes> + '_ {
    let frame_size = frame_size.get();
    (0..payload.len())
        .step_by(frame_size)
        .map(move |start| payload.slice(start..(start + frame_size).min(payload.len())))
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub frame_size: NonZeroUsize,
    pub frame_delay: Duration,
    pub high_water_mark: usize,
    pub drain_timeout: Duration,
}

impl From<&StreamSection> for StreamOptions {
    fn from(s: &StreamSection) -> Self {
        Self {
            frame_size: s.frame_size,
            frame_delay: Duration::from_millis(s.frame_delay_ms),
            high_water_mark: s.high_water_mark,
            drain_timeout: Duration::from_millis(s.drain_timeout_ms),
        }
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&StreamSection::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// All frames and the `END` sentinel went out.
    Completed { frames: usize, bytes: usize },
    /// An `ERROR:` sentinel went out, possibly after some frames.
    Failed { frames: usize },
    /// The channel stopped accepting frames; nothing more could be sent.
    Truncated { frames: usize },
    Cancelled { frames: usize },
}

enum Readiness {
    Ready,
    Closed,
    Stalled,
    Cancelled,
}

/// Waits until the channel is open and its send buffer is at or below the
/// high-water mark, polling every `frame_delay`.
async fn wait_until_ready(
    channel: &dyn DataChannel,
    opts: &StreamOptions,
    cancel: &CancellationToken,
) -> Readiness {
    let deadline = Instant::now() + opts.drain_timeout;
    let poll = opts.frame_delay.max(Duration::from_millis(1));
    loop {
        if cancel.is_cancelled() {
            return Readiness::Cancelled;
        }
        if !channel.is_open() {
            return Readiness::Closed;
        }
        if channel.buffered_amount().await <= opts.high_water_mark {
            return Readiness::Ready;
        }
        if Instant::now() >= deadline {
            return Readiness::Stalled;
        }
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = cancel.cancelled() => return Readiness::Cancelled,
        }
    }
}

const STALLED: &str = "data channel send buffer did not drain";

/// Sends one synthesis result over `channel`.
pub async fn stream_payload(
    channel: &dyn DataChannel,
    result: Result<Bytes, SynthesisError>,
    opts: &StreamOptions,
    cancel: &CancellationToken,
) -> StreamOutcome {
    let payload = match result {
        Ok(payload) => payload,
        Err(e) => return send_error(channel, e, 0, cancel).await,
    };

    let mut frames = 0;
    for frame in split_frames(&payload, opts.frame_size) {
        if let Some(outcome) = ensure_ready(channel, frames, opts, cancel).await {
            return outcome;
        }
        if let Err(e) = channel.send_binary(frame).await {
            warn!(error = %e, frames, "frame send failed");
            return truncated(frames);
        }
        frames += 1;

        if !opts.frame_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(opts.frame_delay) => {}
                _ = cancel.cancelled() => return StreamOutcome::Cancelled { frames },
            }
        }
    }

    if let Some(outcome) = ensure_ready(channel, frames, opts, cancel).await {
        return outcome;
    }
    if let Err(e) = channel.send_text(END_SENTINEL.to_string()).await {
        warn!(error = %e, "END sentinel send failed");
        return truncated(frames);
    }
    StreamOutcome::Completed {
        frames,
        bytes: payload.len(),
    }
}

/// `None` when the next frame may go out, otherwise how the stream ended.
async fn ensure_ready(
    channel: &dyn DataChannel,
    frames: usize,
    opts: &StreamOptions,
    cancel: &CancellationToken,
) -> Option<StreamOutcome> {
    match wait_until_ready(channel, opts, cancel).await {
        Readiness::Ready => None,
        Readiness::Closed => Some(truncated(frames)),
        Readiness::Cancelled => Some(StreamOutcome::Cancelled { frames }),
        Readiness::Stalled => Some(send_error(channel, STALLED, frames, cancel).await),
    }
}

// A stalled buffer still takes one short text frame; only closure stops it.
async fn send_error(
    channel: &dyn DataChannel,
    reason: impl std::fmt::Display,
    frames: usize,
    cancel: &CancellationToken,
) -> StreamOutcome {
    if cancel.is_cancelled() {
        return StreamOutcome::Cancelled { frames };
    }
    if !channel.is_open() {
        return truncated(frames);
    }
    match channel.send_text(error_sentinel(reason)).await {
        Ok(()) => StreamOutcome::Failed { frames },
        Err(e) => {
            warn!(error = %e, "ERROR sentinel send failed");
            truncated(frames)
        }
    }
}

fn truncated(frames: usize) -> StreamOutcome {
    warn!(frames, "data channel closed mid-stream, remaining audio dropped");
    StreamOutcome::Truncated { frames }
}

/// Queue feeding one session's speech worker.
#[derive(Clone)]
pub struct SpeechQueue {
    tx: mpsc::Sender<String>,
}

impl SpeechQueue {
    /// Hands `text` to the worker. Fails when `queue_depth` requests are
    /// already waiting or the worker has stopped.
    pub fn enqueue(&self, text: String) -> Result<(), QueueError> {
        self.tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Stopped,
        })
    }
}

/// Serves speech requests for one data channel strictly one at a time, so
/// frames of different requests never interleave.
pub struct SpeechWorker {
    session_id: String,
    channel: Arc<dyn DataChannel>,
    synthesis: SynthesisGateway,
    opts: StreamOptions,
    cancel: CancellationToken,
}

impl SpeechWorker {
    pub fn spawn(
        session_id: String,
        channel: Arc<dyn DataChannel>,
        synthesis: SynthesisGateway,
        opts: StreamOptions,
        queue_depth: usize,
        cancel: CancellationToken,
    ) -> (SpeechQueue, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_depth);
        let worker = Self {
            session_id,
            channel,
            synthesis,
            opts,
            cancel,
        };
        let handle = tokio::spawn(worker.run(rx));
        (SpeechQueue { tx }, handle)
    }

    async fn run(self, mut rx: mpsc::Receiver<String>) {
        let session_id = self.session_id.as_str();
        loop {
            let text = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(text) => text,
                    None => break,
                },
            };

            debug!(session_id, chars = text.len(), "speech request");
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = self.synthesis.synthesize(&text) => r,
            };
            if let Err(e) = &result {
                warn!(session_id, error = %e, "synthesis failed");
            }

            let outcome =
                stream_payload(self.channel.as_ref(), result, &self.opts, &self.cancel).await;
            info!(session_id, ?outcome, "speech request finished");
            if matches!(outcome, StreamOutcome::Cancelled { .. }) {
                break;
            }
        }
        debug!(session_id, "speech worker stopped");
    }
}
