use thiserror::Error;

/// Errors surfaced to callers of the watcher.
///
/// Connection failures never appear here; readers absorb them and retry.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("pod '{0}' is not being watched")]
    NotFound(String),

    #[error("watcher has been shut down")]
    ShutDown,

    #[error("invalid pod name '{0}'")]
    InvalidPodName(String),

    #[error("invalid search pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WatchError>;

/// Check that `name` is a valid pod name (an RFC 1123 subdomain).
pub fn validate_pod_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 253
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
        && name.bytes().next().is_some_and(|b| b.is_ascii_alphanumeric())
        && name.bytes().last().is_some_and(|b| b.is_ascii_alphanumeric());

    if valid {
        Ok(())
    } else {
        Err(WatchError::InvalidPodName(name.to_string()))
    }
}
