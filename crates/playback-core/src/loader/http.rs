use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use tracing::{debug, warn};

use super::{LoadError, LoadRequest, LoadResponse, Loader};
use crate::config::PlayerConfig;

/// Plain HTTP loader with connection pooling, retries and jittered backoff.
///
/// This is the engine's default fetch behaviour; sessions wrap it in a
/// [`super::SubstitutingLoader`].
#[derive(Debug, Clone)]
pub struct HttpLoader {
    client: Client,
    max_retries: u32,
    base_backoff: Duration,
}

impl HttpLoader {
    pub fn new(timeout: Duration, max_retries: u32, base_backoff: Duration) -> Self {
        Self::with_client(Self::build_client(timeout), max_retries, base_backoff)
    }

    pub fn with_client(client: Client, max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            client,
            max_retries,
            base_backoff,
        }
    }

    pub fn from_config(config: &PlayerConfig) -> Self {
        Self::new(config.request_timeout, config.max_retries, config.retry_backoff)
    }

    pub fn from_config_with_client(config: &PlayerConfig, client: Client) -> Self {
        Self::with_client(client, config.max_retries, config.retry_backoff)
    }

    pub fn build_client(timeout: Duration) -> Client {
        Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(20)
            .gzip(true)
            .build()
            .expect("Failed to build HTTP client")
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff * 2u32.saturating_pow(attempt - 1);
        let jitter_ms = (base.as_millis() as u64) / 5;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }
}

impl Default for HttpLoader {
    fn default() -> Self {
        Self::from_config(&PlayerConfig::default())
    }
}

#[async_trait]
impl Loader for HttpLoader {
    async fn load(&self, request: &LoadRequest) -> Result<LoadResponse, LoadError> {
        let url = request.url.as_str();
        let kind = request.kind;
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            let is_last = attempt == self.max_retries;

            if attempt > 0 {
                let backoff = self.backoff(attempt);
                debug!(url, %kind, attempt, backoff_ms = backoff.as_millis(), "Retrying fetch");
                tokio::time::sleep(backoff).await;
            }

            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => match response.bytes().await {
                    Ok(body) => {
                        return Ok(LoadResponse {
                            url: url.to_string(),
                            body,
                        })
                    }
                    Err(e) => {
                        last_error = Some(LoadError::Network {
                            url: url.to_string(),
                            reason: e.to_string(),
                            is_last_retry: is_last,
                        });
                    }
                },
                Ok(response) => {
                    let status = response.status().as_u16();
                    let message = response
                        .status()
                        .canonical_reason()
                        .unwrap_or("Unknown")
                        .to_string();
                    warn!(url, %kind, status, attempt, "Fetch returned error status");

                    // An expired signature answers 403; retrying cannot help.
                    let retryable = !(400..500).contains(&status) || status == 429;
                    let err = LoadError::Http {
                        url: url.to_string(),
                        status,
                        message,
                        is_last_retry: is_last || !retryable,
                    };
                    if !retryable {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
                Err(e) if e.is_timeout() => {
                    warn!(url, %kind, attempt, "Fetch timed out");
                    last_error = Some(LoadError::Timeout {
                        url: url.to_string(),
                        is_last_retry: is_last,
                    });
                }
                Err(e) => {
                    warn!(url, %kind, attempt, error = %e, "Fetch network error");
                    last_error = Some(LoadError::Network {
                        url: url.to_string(),
                        reason: e.to_string(),
                        is_last_retry: is_last,
                    });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LoadError::Network {
            url: url.to_string(),
            reason: "no attempt was made".to_string(),
            is_last_retry: true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn loader(max_retries: u32) -> HttpLoader {
        HttpLoader::new(Duration::from_secs(5), max_retries, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn load_returns_body_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rec/abc.m3u8"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U\n#EXT-X-VERSION:3"))
            .mount(&server)
            .await;

        let url = format!("{}/rec/abc.m3u8", server.uri());
        let resp = loader(0).load(&LoadRequest::manifest(&url)).await.unwrap();
        assert!(resp.text().contains("#EXTM3U"));
        assert_eq!(resp.url, url);
    }

    #[tokio::test]
    async fn load_returns_binary_segment_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rec/abc_320p_00001.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x47u8, 0x00, 0xff]))
            .mount(&server)
            .await;

        let url = format!("{}/rec/abc_320p_00001.ts", server.uri());
        let resp = loader(0).load(&LoadRequest::segment(url)).await.unwrap();
        assert_eq!(&resp.body[..], &[0x47, 0x00, 0xff]);
    }

    #[tokio::test]
    async fn expired_signature_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rec/abc.m3u8"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let err = loader(3)
            .load(&LoadRequest::manifest(format!("{}/rec/abc.m3u8", server.uri())))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(403));
        assert!(err.is_last_retry());
    }

    #[tokio::test]
    async fn load_retries_on_500_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/retry.m3u8"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/retry.m3u8"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U\nOK"))
            .mount(&server)
            .await;

        let resp = loader(3)
            .load(&LoadRequest::level(format!("{}/retry.m3u8", server.uri())))
            .await
            .unwrap();
        assert!(resp.text().contains("OK"));
    }

    #[tokio::test]
    async fn load_marks_last_retry_after_exhaustion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fail.m3u8"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = loader(2)
            .load(&LoadRequest::level(format!("{}/fail.m3u8", server.uri())))
            .await
            .unwrap_err();
        assert!(err.is_last_retry());
        assert_eq!(err.status_code(), Some(503));
    }
}
