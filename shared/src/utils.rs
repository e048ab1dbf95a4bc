//! Utility functions for the ClaudeCluster dispatcher
//!
//! This module provides the small set of helpers shared by the coordinator
//! and worker components: artifact hashing, identifier and URL validation,
//! and retry backoff.

use blake3::Hasher;
use std::path::Path;

/// Calculate BLAKE3 checksum of file contents
///
/// Reads the file and returns its BLAKE3 hash as a hex-encoded string
/// (64 characters).
pub fn calculate_file_checksum<P: AsRef<Path>>(file_path: P) -> crate::Result<String> {
    let content = std::fs::read(file_path)?;
    let mut hasher = Hasher::new();
    hasher.update(&content);
    Ok(hasher.finalize().to_hex().to_string())
}

/// Validate worker ID format
///
/// Worker IDs must contain only alphanumeric characters, hyphens, and underscores.
/// They must not be empty and should be reasonable in length.
pub fn validate_worker_id(worker_id: &str) -> crate::Result<()> {
    if worker_id.is_empty() {
        return Err(
            crate::ClusterError::Validation("Worker ID cannot be empty".to_string()).into(),
        );
    }

    if worker_id.len() > 64 {
        return Err(crate::ClusterError::Validation(
            "Worker ID cannot be longer than 64 characters".to_string(),
        )
        .into());
    }

    if !worker_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(crate::ClusterError::Validation(
            "Worker ID can only contain alphanumeric characters, hyphens, and underscores"
                .to_string(),
        )
        .into());
    }

    Ok(())
}

/// Calculate exponential backoff delay for retries
pub fn calculate_backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let delay = base_delay_ms.saturating_mul(2_u64.pow(attempt.min(10))); // Cap at 2^10 to prevent overflow
    delay.min(max_delay_ms)
}

/// Validate URL format and structure
///
/// Performs proper URL parsing to ensure:
/// - URL is syntactically valid
/// - Uses http or https scheme
/// - Has a valid host
/// - Does not contain embedded credentials (security risk)
pub fn validate_url(url_str: &str) -> crate::Result<()> {
    use url::Url;

    let parsed = Url::parse(url_str).map_err(|e| {
        crate::ClusterError::Validation(format!("Invalid URL '{}': {}", url_str, e))
    })?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(crate::ClusterError::Validation(format!(
            "URL '{}' must use http:// or https:// scheme",
            url_str
        ))
        .into());
    }

    if parsed.host().is_none() {
        return Err(crate::ClusterError::Validation(format!(
            "URL '{}' must have a valid host",
            url_str
        ))
        .into());
    }

    // Reject URLs with embedded credentials
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(crate::ClusterError::Validation(format!(
            "URL '{}' must not contain embedded credentials (use separate authentication)",
            url_str
        ))
        .into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_file_checksum_is_stable() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "echo hi").unwrap();
        let first = calculate_file_checksum(file.path()).unwrap();
        let second = calculate_file_checksum(file.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);

        let mut other = NamedTempFile::new().unwrap();
        write!(other, "echo bye").unwrap();
        assert_ne!(first, calculate_file_checksum(other.path()).unwrap());
    }

    #[test]
    fn test_file_checksum_of_missing_file_is_error() {
        assert!(calculate_file_checksum("/nonexistent/claudecluster-checksum").is_err());
    }

    #[test]
    fn test_validate_worker_id() {
        assert!(validate_worker_id("worker-1").is_ok());
        assert!(validate_worker_id("w_01").is_ok());
        assert!(validate_worker_id("").is_err());
        assert!(validate_worker_id("bad worker").is_err());
        assert!(validate_worker_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("http://w1:7081").is_ok());
        assert!(validate_url("https://workers.example.com").is_ok());
        assert!(validate_url("ftp://w1").is_err());
        assert!(validate_url("http://user:pass@w1").is_err());
        assert!(validate_url("not a url").is_err());
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(calculate_backoff_delay(0, 1000, 60_000), 1000);
        assert_eq!(calculate_backoff_delay(1, 1000, 60_000), 2000);
        assert_eq!(calculate_backoff_delay(3, 1000, 60_000), 8000);
        assert_eq!(calculate_backoff_delay(10, 1000, 60_000), 60_000);
        // Zero base keeps every attempt immediate
        assert_eq!(calculate_backoff_delay(5, 0, 60_000), 0);
    }
}
