use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "BULKFETCH_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/bulkfetch.toml";
const ENV_PREFIX: &str = "BULKFETCH";
const ENV_SEPARATOR: &str = "__";
const SEARCH_PASSWORD_VAR: &str = "BULKFETCH_SEARCH_PASSWORD";

/// Load configuration from multiple sources with priority:
/// (`path` overrides `BULKFETCH_CONFIG` and the default location)
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load(path: Option<PathBuf>) -> Result<Config, ConfigError> {
    // a missing .env is fine
    let _ = dotenvy::dotenv();

    let config_path = path.unwrap_or_else(|| {
        env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    });

    let mut config = load_from_sources(config_path)?;
    load_secrets(&mut config);

    Ok(config)
}

/// Secrets are never read from TOML files
fn load_secrets(config: &mut Config) {
    apply_password(config, env::var(SEARCH_PASSWORD_VAR).ok());
}

fn apply_password(config: &mut Config, password: Option<String>) {
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        config.search.password = Some(password);
    }
}

/// Load configuration from a specific path and the environment
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::warn!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // BULKFETCH__ENGINE__CONCURRENCY -> engine.concurrency
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_defaults_only() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.engine.concurrency, 4);
        assert_eq!(config.downloads.max_images, 1000);
        assert!(config.archives.contains_key("fourplebs"));
        assert!(config.search.password.is_none());
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[engine]
concurrency = 8
backoff_unit = "250ms"
chunk_size = "4KB"

[downloads]
max_images = 50
staging_root = "/tmp/bulkfetch"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.engine.concurrency, 8);
        assert_eq!(config.engine.backoff_unit.as_duration().as_millis(), 250);
        assert_eq!(config.engine.chunk_size.as_u64(), 4 * 1024);
        assert_eq!(config.engine.max_attempts, 3);
        assert_eq!(config.downloads.max_images, 50);
    }

    #[test]
    fn test_archive_table_replaces_builtins() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[downloads]
default_archive = "local"
fallback_archive = "local"

[archives.local]
api_base = "http://127.0.0.1:8000"
cdn_pattern = "http://127.0.0.1:8000/{board}/{filename}"
boards = ["g", "pol"]
profile = "browser"
request_interval = "1s"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.archives.len(), 1);

        let local = &config.archives["local"];
        assert!(local.hosts_board("pol"));
        assert_eq!(local.concurrency, 4);
        assert!(local.verify_tls);
        assert_eq!(local.request_interval.as_duration().as_secs(), 1);
    }

    #[test]
    fn test_password_is_not_read_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[search]
url = "https://search.example"
user = "analyst"
password = "from-file"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.search.user.as_deref(), Some("analyst"));
        assert!(config.search.password.is_none());
    }

    #[test]
    fn test_explicit_path_goes_through_full_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("explicit.toml");
        fs::write(&config_path, "[engine]\nconcurrency = 11\n").unwrap();

        let mut config = load(Some(config_path)).unwrap();
        assert_eq!(config.engine.concurrency, 11);

        apply_password(&mut config, Some(String::new()));
        assert!(config.search.password.is_none());
        apply_password(&mut config, Some("s3cret".to_string()));
        assert_eq!(config.search.password.as_deref(), Some("s3cret"));
    }
}
