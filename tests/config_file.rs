use std::io::Write;
use std::time::Duration;

use voicecast_lib::error::ConfigError;
use voicecast_lib::Config;

#[test]
fn loads_sections_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[server]
bind = "127.0.0.1:9000"

[[ice.servers]]
id = "relay"
type = "turn"
url = "relay.example.org:3478"
username = "u"
credential = "p"

[stream]
frame_size = 4096
frame_delay_ms = 0

[synthesis]
program = "/usr/local/bin/speak"
args = ["{{text}}", "{{output}}"]
timeout_secs = 15

[session]
grace_period_secs = 3
"#
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.server.bind.port(), 9000);
    assert_eq!(config.ice.servers.len(), 1);
    assert_eq!(config.ice.servers[0].r#type, "turn");
    assert_eq!(config.stream.frame_size.get(), 4096);
    assert_eq!(config.stream.queue_depth, 8);
    assert_eq!(config.synthesis.args, vec!["{text}", "{output}"]);
    assert_eq!(config.synthesis_timeout(), Some(Duration::from_secs(15)));
    assert_eq!(config.grace_period(), Duration::from_secs(3));
    assert_eq!(config.close_timeout(), Duration::from_secs(5));
}

#[test]
fn missing_file_is_a_read_error() {
    let err = Config::load(Some(std::path::Path::new("/nonexistent/voicecast.toml"))).unwrap_err();
    assert!(matches!(err, ConfigError::FileRead { .. }));
}

#[test]
fn no_file_means_defaults() {
    let config = Config::load(None).unwrap();
    assert_eq!(config.server.bind.port(), 8080);
    assert_eq!(config.synthesis.program, "tts");
}
