use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::SynthesisSection;
use crate::error::SynthesisError;

/// External text-to-speech engine. Renders `text` into the file at `output`.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    async fn render(&self, text: &str, output: &Path) -> Result<(), SynthesisError>;
}

/// Runs a TTS command line per request.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(section: &SynthesisSection) -> Self {
        Self::new(section.program.clone(), section.args.clone())
    }

    fn expand_args(&self, text: &str, output: &Path) -> Vec<String> {
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| fill_placeholders(arg, text, &output))
            .collect()
    }
}

/// Substitutes `{text}` and `{output}` in a single left-to-right pass;
/// substituted values are never scanned again.
fn fill_placeholders(template: &str, text: &str, output: &str) -> String {
    let mut filled = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        filled.push_str(&rest[..open]);
        let tail = &rest[open..];
        if let Some(after) = tail.strip_prefix("{text}") {
            filled.push_str(text);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{output}") {
            filled.push_str(output);
            rest = after;
        } else {
            filled.push('{');
            rest = &tail[1..];
        }
    }
    filled.push_str(rest);
    filled
}

#[async_trait]
impl SpeechEngine for CommandEngine {
    async fn render(&self, text: &str, output: &Path) -> Result<(), SynthesisError> {
        let result = Command::new(&self.program)
            .args(self.expand_args(text, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SynthesisError::Engine(format!("failed to run {}: {e}", self.program)))?;

        if result.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&result.stderr);
        let reason = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no diagnostic output")
            .trim()
            .to_string();
        Err(SynthesisError::Engine(format!(
            "{} exited with {}: {reason}",
            self.program, result.status
        )))
    }
}

/// Uniform `text -> audio bytes` contract over a [`SpeechEngine`].
#[derive(Clone)]
pub struct SynthesisGateway {
    engine: Arc<dyn SpeechEngine>,
    timeout: Option<Duration>,
}

impl SynthesisGateway {
    pub fn new(engine: Arc<dyn SpeechEngine>, timeout: Option<Duration>) -> Self {
        Self { engine, timeout }
    }

    /// The temporary output file lives only as long as this future; it is
    /// removed on success, failure, timeout, and when the caller drops us.
    pub async fn synthesize(&self, text: &str) -> Result<Bytes, SynthesisError> {
        if text.trim().is_empty() {
            return Err(SynthesisError::EmptyText);
        }

        let output = tempfile::Builder::new()
            .prefix("output_")
            .suffix(".wav")
            .tempfile()?;

        let render = self.engine.render(text, output.path());
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, render).await {
                Ok(r) => r?,
                Err(_) => {
                    warn!(?limit, "synthesis timed out");
                    return Err(SynthesisError::Timeout(limit));
                }
            },
            None => render.await?,
        }

        let audio = tokio::fs::read(output.path()).await?;
        if audio.is_empty() {
            return Err(SynthesisError::Engine("engine produced no audio".into()));
        }
        debug!(bytes = audio.len(), chars = text.len(), "synthesized");
        Ok(Bytes::from(audio))
    }
}
