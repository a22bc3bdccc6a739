//! Service configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file at all) gives a working service.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8080"
//!
//! [[ice.servers]]
//! id = "relay"
//! type = "turn"
//! url = "relay.example.org:3478"
//! username = "user"
//! credential = "secret"
//!
//! [stream]
//! frame_size = 16000
//! frame_delay_ms = 10
//!
//! [synthesis]
//! program = "tts"
//! timeout_secs = 60
//! ```

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::peer::types::ServerConfig;

const DEFAULT_FRAME_SIZE: NonZeroUsize = match NonZeroUsize::new(16_000) {
    Some(n) => n,
    None => unreachable!(),
};

static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub ice: IceSection,
    pub stream: StreamSection,
    pub synthesis: SynthesisSection,
    pub session: SessionSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: SocketAddr,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceSection {
    pub servers: Vec<ServerConfig>,
}

impl Default for IceSection {
    fn default() -> Self {
        Self {
            servers: DEFAULT_ICE_SERVERS.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    /// Maximum payload bytes per data-channel frame; zero fails to parse.
    pub frame_size: NonZeroUsize,
    /// Pause between frames; also the poll interval while the send buffer drains.
    pub frame_delay_ms: u64,
    /// Frames wait while the channel has more than this many bytes buffered.
    pub high_water_mark: usize,
    pub drain_timeout_ms: u64,
    /// Speech requests a session may have waiting behind the one streaming.
    pub queue_depth: usize,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            frame_delay_ms: 10,
            high_water_mark: 1024 * 1024,
            drain_timeout_ms: 5_000,
            queue_depth: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisSection {
    pub program: String,
    /// `{text}` and `{output}` are substituted per request.
    pub args: Vec<String>,
    /// Zero disables the timeout.
    pub timeout_secs: u64,
}

impl Default for SynthesisSection {
    fn default() -> Self {
        Self {
            program: "tts".into(),
            args: vec![
                "--model_name".into(),
                "tts_models/en/ljspeech/vits".into(),
                "--text".into(),
                "{text}".into(),
                "--out_path".into(),
                "{output}".into(),
            ],
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// How long a `disconnected` peer may take to come back.
    pub grace_period_secs: u64,
    /// How long shutdown waits for each session to finish closing.
    pub close_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            grace_period_secs: 10,
            close_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub filter: Option<String>,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice.servers {
            if server.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "ICE server `{}` has an empty url",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "TURN server `{}` requires username and credential",
                    server.id
                )));
            }
        }
        if self.stream.queue_depth == 0 {
            return Err(ConfigError::Invalid("stream.queue_depth must be > 0".into()));
        }
        if self.synthesis.program.is_empty() {
            return Err(ConfigError::Invalid("synthesis.program must be set".into()));
        }
        Ok(())
    }

    pub fn synthesis_timeout(&self) -> Option<Duration> {
        (self.synthesis.timeout_secs > 0).then(|| Duration::from_secs(self.synthesis.timeout_secs))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.session.grace_period_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.session.close_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.stream.frame_size.get(), 16_000);
        assert_eq!(config.ice.servers.len(), 2);
        assert_eq!(config.synthesis_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn zero_timeout_disables_it() {
        let config = Config::from_toml_str("[synthesis]\ntimeout_secs = 0\n").unwrap();
        assert_eq!(config.synthesis_timeout(), None);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let raw = r#"
            [[ice.servers]]
            id = "relay"
            type = "turn"
            url = "relay.example.org:3478"
        "#;
        assert!(matches!(
            Config::from_toml_str(raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn zero_frame_size_is_rejected() {
        assert!(matches!(
            Config::from_toml_str("[stream]\nframe_size = 0\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
