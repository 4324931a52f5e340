//! Frame store backed by a plain HTTP object endpoint.
//!
//! Objects live at `{endpoint}/{key}`; `GET {endpoint}?prefix=..` returns a
//! JSON array of keys.

use crate::io::storage::{validate_key, FrameStore};
use crate::types::{CalError, CalResult};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use std::time::Duration;

const MAX_RETRIES: u32 = 3;

pub struct HttpStore {
    endpoint: String,
    client: Client,
    retry_delay: Duration,
}

impl HttpStore {
    pub fn new(endpoint: &str, timeout_secs: u64) -> CalResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("astrocal/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CalError::StorageUnavailable(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
            retry_delay: Duration::from_secs(2),
        })
    }

    /// Delay between attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint, key)
    }

    /// Retry transport failures and 5xx replies; anything else is returned as is
    fn with_retries<F>(&self, what: &str, mut send: F) -> CalResult<Response>
    where
        F: FnMut(&Client) -> reqwest::Result<Response>,
    {
        let mut last_error = None;
        for attempt in 1..=MAX_RETRIES {
            log::debug!("{} attempt {} of {}", what, attempt, MAX_RETRIES);
            match send(&self.client) {
                Ok(response) if !response.status().is_server_error() => return Ok(response),
                Ok(response) => {
                    last_error = Some(CalError::StorageUnavailable(format!(
                        "HTTP {} for {}",
                        response.status().as_u16(),
                        what
                    )));
                }
                Err(e) => {
                    last_error = Some(CalError::StorageUnavailable(format!("HTTP request failed: {}", e)));
                }
            }
            if attempt < MAX_RETRIES {
                log::warn!("{} attempt {} failed, retrying...", what, attempt);
                std::thread::sleep(self.retry_delay);
            }
        }
        Err(last_error.unwrap_or_else(|| {
            CalError::StorageUnavailable(format!("{} failed after all retries", what))
        }))
    }

    fn check_status(response: Response, key: &str) -> CalResult<Response> {
        match response.status() {
            StatusCode::NOT_FOUND => Err(CalError::StorageNotFound(key.to_string())),
            s if s.is_success() => Ok(response),
            s => Err(CalError::StorageUnavailable(format!(
                "HTTP {} {}: {}",
                s.as_u16(),
                s.canonical_reason().unwrap_or(""),
                key
            ))),
        }
    }
}

impl FrameStore for HttpStore {
    fn get(&self, key: &str) -> CalResult<Vec<u8>> {
        validate_key(key)?;
        let url = self.url(key);
        let response = self.with_retries(&format!("GET {}", key), |c| c.get(&url).send())?;
        let response = Self::check_status(response, key)?;
        let bytes = response
            .bytes()
            .map_err(|e| CalError::StorageUnavailable(format!("Failed to read body: {}", e)))?;
        log::debug!("Fetched {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> CalResult<()> {
        validate_key(key)?;
        let url = self.url(key);
        let response = self.with_retries(&format!("PUT {}", key), |c| {
            c.put(&url).body(bytes.to_vec()).send()
        })?;
        Self::check_status(response, key)?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> CalResult<Vec<String>> {
        let endpoint = self.endpoint.clone();
        let response = self.with_retries(&format!("LIST {}", prefix), |c| {
            c.get(&endpoint).query(&[("prefix", prefix)]).send()
        })?;
        let response = Self::check_status(response, prefix)?;
        let mut keys: Vec<String> = response
            .json()
            .map_err(|e| CalError::StorageUnavailable(format!("Invalid listing: {}", e)))?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> CalResult<()> {
        validate_key(key)?;
        let url = self.url(key);
        let response = self.with_retries(&format!("DELETE {}", key), |c| c.delete(&url).send())?;
        Self::check_status(response, key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalized() {
        let store = HttpStore::new("http://localhost:9/frames/", 1).unwrap();
        assert_eq!(store.endpoint(), "http://localhost:9/frames");
        assert_eq!(store.url("a/b.fits"), "http://localhost:9/frames/a/b.fits");
    }

    #[test]
    fn test_invalid_key_rejected_before_request() {
        let store = HttpStore::new("http://localhost:9", 1).unwrap();
        assert!(matches!(store.get("../x"), Err(CalError::StorageUnavailable(_))));
    }

    #[test]
    fn test_unreachable_endpoint_is_unavailable() {
        // port 9 (discard) is closed on test machines
        let store = HttpStore::new("http://127.0.0.1:9", 1)
            .unwrap()
            .with_retry_delay(Duration::from_millis(1));
        assert!(matches!(store.get("a.fits"), Err(CalError::StorageUnavailable(_))));
    }
}
