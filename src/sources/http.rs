use std::thread;
use std::time::Duration;

use camino::Utf8Path;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::error::HarvestError;
use crate::store::DatasetStore;

const MAX_RETRIES: usize = 3;
const BASE_DELAY_MS: u64 = 200;

/// Blocking HTTP client shared by every downloader.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("imgharvest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| HarvestError::Http(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn get_text(&self, url: &str) -> Result<String, HarvestError> {
        let response = self.get_ok(url)?;
        response
            .text()
            .map_err(|err| HarvestError::Http(err.to_string()))
    }

    pub fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, HarvestError> {
        let response = self.get_ok(url)?;
        response
            .json()
            .map_err(|err| HarvestError::Http(format!("{url}: {err}")))
    }

    pub fn get_bytes(&self, url: &str) -> Result<Vec<u8>, HarvestError> {
        let response = self.get_ok(url)?;
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| HarvestError::Http(format!("{url}: {err}")))
    }

    /// Downloads `url` into `destination` atomically and returns the byte count.
    pub fn download_to(&self, url: &str, destination: &Utf8Path) -> Result<u64, HarvestError> {
        let mut response = self.get_ok(url)?;
        let bytes = DatasetStore::write_stream_atomic(destination, &mut response)?;
        tracing::debug!(url, path = %destination, bytes, "downloaded");
        Ok(bytes)
    }

    fn get_ok(&self, url: &str) -> Result<Response, HarvestError> {
        let response = self.send_with_retries(|| self.client.get(url))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "request failed".to_string());
            return Err(HarvestError::HttpStatus {
                url: url.to_string(),
                status,
                message: truncate(&message, 200),
            });
        }
        Ok(response)
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, HarvestError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        tracing::debug!(status, attempt, "retrying after server status");
                        backoff(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        tracing::debug!(error = %err, attempt, "retrying after transport error");
                        backoff(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Err(HarvestError::Http(err.to_string()));
                }
            }
        }
    }
}

fn backoff(attempt: usize) {
    thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}…", &text[..index]),
        None => text.to_string(),
    }
}
