//! Configuration tests.

use super::*;

/// The TOML template written on first run must parse back into `FileConfig`
/// without error — catches template/parser drift early.
#[test]
fn default_config_roundtrips_through_toml() {
    let config = Config::default();
    let toml_str = config.to_toml();

    let parsed: Result<FileConfig, _> = toml::from_str(&toml_str);
    assert!(
        parsed.is_ok(),
        "default config should round-trip.\nTOML:\n{toml_str}\nError: {:?}",
        parsed.err()
    );
}

#[test]
fn defaults_match_documented_values() {
    let config = Config::default();
    assert_eq!(config.checkpoint_threshold, 0.70);
    assert_eq!(config.swap_threshold, 0.80);
    assert!(!config.passthrough);
    assert_eq!(config.conversation_ttl_seconds, 7200);
    assert_eq!(config.compact_trigger_tokens, 50_000);
    assert_eq!(config.upstream_api_url, "https://api.anthropic.com");
}

#[test]
fn config_path_is_under_dot_config() {
    if let Some(path) = Config::config_path() {
        assert!(path.ends_with(".config/bufferproxy/config.toml"));
    }
}
