use super::models::Config;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must be at least 1")]
    ZeroConcurrency { field: String },

    #[error("engine.max_attempts must be at least 1")]
    ZeroMaxAttempts,

    #[error("engine.chunk_size must be positive")]
    ZeroChunkSize,

    #[error("engine.backoff_unit must be positive")]
    ZeroBackoffUnit,

    #[error("Archive '{archive}' cdn_pattern must contain '{{filename}}'")]
    InvalidCdnPattern { archive: String },

    #[error("Archive '{archive}' api_base is not an http(s) URL: {url}")]
    InvalidApiBase { archive: String, url: String },

    #[error("downloads.{field} references unknown archive '{archive}'")]
    UnknownArchive { field: String, archive: String },

    #[error("search.url must use http or https, got '{url}'")]
    InvalidSearchUrl { url: String },

    #[error("search.max_page_failures must be at least 1")]
    ZeroPageFailures,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_engine(config)?;
    validate_archives(config)?;
    validate_downloads(config)?;
    validate_search(config)?;
    Ok(())
}

fn validate_engine(config: &Config) -> Result<(), ValidationError> {
    let engine = &config.engine;

    if engine.concurrency == 0 {
        return Err(ValidationError::ZeroConcurrency {
            field: "engine.concurrency".to_string(),
        });
    }
    if engine.max_attempts == 0 {
        return Err(ValidationError::ZeroMaxAttempts);
    }
    if engine.chunk_size.as_u64() == 0 {
        return Err(ValidationError::ZeroChunkSize);
    }
    if engine.backoff_unit.as_duration().is_zero() {
        return Err(ValidationError::ZeroBackoffUnit);
    }

    Ok(())
}

fn is_http_url(raw: &str) -> bool {
    url::Url::parse(raw)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

fn validate_archives(config: &Config) -> Result<(), ValidationError> {
    for (name, archive) in &config.archives {
        if !archive.cdn_pattern.contains("{filename}") {
            return Err(ValidationError::InvalidCdnPattern {
                archive: name.clone(),
            });
        }
        if !is_http_url(&archive.api_base) {
            return Err(ValidationError::InvalidApiBase {
                archive: name.clone(),
                url: archive.api_base.clone(),
            });
        }
        if archive.concurrency == 0 {
            return Err(ValidationError::ZeroConcurrency {
                field: format!("archives.{}.concurrency", name),
            });
        }
    }

    Ok(())
}

/// Default and fallback archives must both exist
fn validate_downloads(config: &Config) -> Result<(), ValidationError> {
    let downloads = &config.downloads;

    for (field, archive) in [
        ("default_archive", &downloads.default_archive),
        ("fallback_archive", &downloads.fallback_archive),
    ] {
        if !config.archives.contains_key(archive) {
            return Err(ValidationError::UnknownArchive {
                field: field.to_string(),
                archive: archive.clone(),
            });
        }
    }

    Ok(())
}

fn validate_search(config: &Config) -> Result<(), ValidationError> {
    if let Some(url) = &config.search.url {
        if !is_http_url(url) {
            return Err(ValidationError::InvalidSearchUrl { url: url.clone() });
        }
    }
    if config.search.max_page_failures == 0 {
        return Err(ValidationError::ZeroPageFailures);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::humanize::ByteSize;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_concurrency() {
        let mut config = Config::default();
        config.engine.concurrency = 0;

        assert_eq!(
            validate(&config).unwrap_err(),
            ValidationError::ZeroConcurrency {
                field: "engine.concurrency".to_string()
            }
        );
    }

    #[test]
    fn test_zero_chunk_size() {
        let mut config = Config::default();
        config.engine.chunk_size = ByteSize(0);
        assert_eq!(validate(&config).unwrap_err(), ValidationError::ZeroChunkSize);
    }

    #[test]
    fn test_cdn_pattern_needs_filename() {
        let mut config = Config::default();
        if let Some(archive) = config.archives.get_mut("desuarchive") {
            archive.cdn_pattern = "https://cdn.example/{board}/".to_string();
        }

        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidCdnPattern { archive }) if archive == "desuarchive"
        ));
    }

    #[test]
    fn test_unknown_fallback_archive() {
        let mut config = Config::default();
        config.downloads.fallback_archive = "nowhere".to_string();

        assert!(matches!(
            validate(&config),
            Err(ValidationError::UnknownArchive { field, .. }) if field == "fallback_archive"
        ));
    }

    #[test]
    fn test_search_url_scheme() {
        let mut config = Config::default();
        config.search.url = Some("ftp://search.example".to_string());
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidSearchUrl { .. })
        ));

        config.search.url = Some("https://search.example".to_string());
        assert!(validate(&config).is_ok());
    }
}
