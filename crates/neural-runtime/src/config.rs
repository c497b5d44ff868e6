//! Configuration loading from `~/.neural/config.toml` with defaults.
//!
//! Environment variables override the file:
//!
//! - `NEURAL_TRANSPORT`: `local` or `socket`
//! - `NEURAL_HUB_ADDR`: `host:port` of the hub

use neural_types::config::NeuralConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const ENV_TRANSPORT: &str = "NEURAL_TRANSPORT";
pub const ENV_HUB_ADDR: &str = "NEURAL_HUB_ADDR";

/// Load configuration from a TOML file, falling back to defaults.
///
/// A missing, unreadable, unparsable or invalid file is logged and replaced
/// by the defaults. Environment overrides are applied last.
pub fn load_config(path: Option<&Path>) -> NeuralConfig {
    let mut config = read_config_file(path);
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

fn read_config_file(path: Option<&Path>) -> NeuralConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return NeuralConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return NeuralConfig::default();
        }
    };

    let config = match toml::from_str::<NeuralConfig>(&contents) {
        Ok(config) => config,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            return NeuralConfig::default();
        }
    };

    if let Err(e) = config.validate() {
        warn!(
            error = %e,
            path = %config_path.display(),
            "Invalid config, using defaults"
        );
        return NeuralConfig::default();
    }

    info!(path = %config_path.display(), "Loaded configuration");
    config
}

/// Apply overrides from an environment lookup. Bad values are logged and
/// ignored.
pub fn apply_env_overrides(config: &mut NeuralConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(kind) = lookup(ENV_TRANSPORT) {
        match kind.parse() {
            Ok(kind) => config.transport.kind = kind,
            Err(e) => warn!(error = %e, var = ENV_TRANSPORT, "Ignoring override"),
        }
    }
    if let Some(addr) = lookup(ENV_HUB_ADDR) {
        if addr.trim().is_empty() {
            warn!(var = ENV_HUB_ADDR, "Ignoring empty override");
        } else {
            config.transport.hub_addr = addr.trim().to_string();
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    neural_home().join("config.toml")
}

/// Get the default Neural Protocol home directory.
pub fn neural_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".neural")
}

#[cfg(test)]
mod tests {
    use super::*;
    use neural_types::config::TransportKind;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_load_config_missing_file() {
        let config = read_config_file(Some(Path::new("/nonexistent/neural.toml")));
        assert_eq!(config, NeuralConfig::default());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            log_level = "debug"

            [transport]
            kind = "socket"
            hub_addr = "10.0.0.5:9000"

            [synapse]
            learning_rate = 0.1

            [agent]
            error_pause_ms = 50
            "#
        )
        .unwrap();

        let config = read_config_file(Some(file.path()));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.transport.kind, TransportKind::Socket);
        assert_eq!(config.transport.hub_addr, "10.0.0.5:9000");
        assert_eq!(config.synapse.learning_rate, 0.1);
        assert_eq!(config.synapse.baseline, 0.5);
        assert_eq!(config.agent.error_pause_ms, 50);
        assert_eq!(config.agent.history_len, 100);
    }

    #[test]
    fn test_unparsable_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is [not toml").unwrap();
        assert_eq!(read_config_file(Some(file.path())), NeuralConfig::default());
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[synapse]\nmin = 2.0\nmax = 1.0").unwrap();
        assert_eq!(read_config_file(Some(file.path())), NeuralConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = NeuralConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[(ENV_TRANSPORT, "tcp"), (ENV_HUB_ADDR, " hub:8765 ")]),
        );
        assert_eq!(config.transport.kind, TransportKind::Socket);
        assert_eq!(config.transport.hub_addr, "hub:8765");
    }

    #[test]
    fn test_bad_env_overrides_are_ignored() {
        let mut config = NeuralConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[(ENV_TRANSPORT, "smoke-signals"), (ENV_HUB_ADDR, "  ")]),
        );
        assert_eq!(config, NeuralConfig::default());
    }

    #[test]
    fn test_default_path() {
        let path = default_config_path();
        assert!(path.ends_with(".neural/config.toml"));
    }
}
