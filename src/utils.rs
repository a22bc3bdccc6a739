use crate::peer::types::ServerConfig;
use rand::Rng;

/// Session identifier: 8 random bytes, hex encoded.
pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

const ICE_SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

// Prefixes the ICE server URL with a scheme derived from its type when missing
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if ICE_SCHEMES.iter().any(|s| config.url.starts_with(s)) {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}
