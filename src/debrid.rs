use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::store::SettingsStore;

/// Failure classes for outbound Real-Debrid calls. The split matters for the
/// retry policy: only transient failures are worth waiting out, and a 401
/// can only be fixed by replacing the token.
#[derive(Debug, Error)]
pub enum DebridError {
    #[error("Real-Debrid API key is not configured")]
    MissingApiKey,
    #[error("Real-Debrid rejected the access token (HTTP 401)")]
    AuthExpired,
    #[error("not found on Real-Debrid (HTTP 404)")]
    NotFound,
    #[error("Real-Debrid unavailable (HTTP {status})")]
    Unavailable { status: StatusCode },
    #[error("Real-Debrid returned HTTP {status}: {detail}")]
    Upstream { status: StatusCode, detail: String },
    #[error("submission failed after {attempts} attempts")]
    RetriesExhausted { attempts: usize },
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl DebridError {
    /// True for failures a retry can plausibly outlast: connection problems
    /// and temporary upstream conditions (5xx, rate limiting).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Unavailable { .. })
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired)
    }
}

const MAX_BACKOFF_EXPONENT: usize = 16;
const MAX_BACKOFF_SECS: f64 = 600.0;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub backoff_base_sec: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            attempts: config.submit_retry_attempts,
            backoff_base_sec: config.submit_retry_backoff_sec,
        }
    }

    /// Doubling backoff: base, 2x base, 4x base, ... after the n-th attempt.
    /// Capped so an oversized attempt budget cannot overflow the delay.
    fn backoff_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT) as i32;
        let secs = self.backoff_base_sec * 2f64.powi(exponent);
        Duration::from_secs_f64(secs.clamp(0.0, MAX_BACKOFF_SECS))
    }
}

/// Runs `call` until it succeeds or the attempt budget runs out. Transient
/// failures back off exponentially; an expired token consults `refresh` and
/// retries immediately when the token changed (those retries spend the same
/// budget); every other error is returned at once.
pub async fn retry_submit<T, C, CF, R, RF>(
    policy: RetryPolicy,
    mut call: C,
    mut refresh: R,
) -> Result<T, DebridError>
where
    C: FnMut() -> CF,
    CF: std::future::Future<Output = Result<T, DebridError>>,
    R: FnMut() -> RF,
    RF: std::future::Future<Output = bool>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error: Option<DebridError> = None;

    for attempt in 1..=attempts {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_auth_expired() => {
                if !refresh().await {
                    return Err(err);
                }
                debug!(attempt, "token refreshed, retrying without backoff");
                last_error = Some(err);
            }
            Err(err) if err.is_transient() => {
                warn!(attempt, attempts, "submission attempt failed: {err}");
                last_error = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(policy.backoff_delay(attempt)).await;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_error.unwrap_or(DebridError::RetriesExhausted { attempts }))
}

/// Response of `POST /torrents/addMagnet`.
#[derive(Debug, Clone, Deserialize)]
pub struct AddedMagnet {
    pub id: String,
    #[serde(default)]
    pub uri: String,
}

/// One entry of `GET /torrents`, trimmed to the fields the duplicate check
/// reads.
#[derive(Debug, Clone, Deserialize)]
pub struct TorrentSummary {
    pub id: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub status: String,
}

enum Payload {
    Empty,
    Form(Vec<(&'static str, String)>),
    Raw {
        bytes: Vec<u8>,
        content_type: String,
    },
}

/// Thin client over the Real-Debrid REST v1.0 API. The bearer token is read
/// from the settings store on every request so a key rotated through the UI
/// takes effect without a restart.
pub struct DebridClient {
    http: reqwest::Client,
    base_url: String,
    settings: Arc<SettingsStore>,
}

impl DebridClient {
    pub fn new(config: &AppConfig, settings: Arc<SettingsStore>) -> Self {
        Self::with_base_url(
            config.debrid_base_url.clone(),
            Duration::from_secs(config.debrid_timeout_seconds),
            settings,
        )
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        timeout: Duration,
        settings: Arc<SettingsStore>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("rdgrab/0.1")
            .build()
            .expect("reqwest client init should not fail");

        Self {
            http,
            base_url: base_url.into(),
            settings,
        }
    }

    /// Token refresh hook for the 401 path. Real-Debrid keys are long-lived
    /// and rotated manually, so this only logs; the next request re-reads
    /// whatever key the settings store holds.
    pub async fn refresh_token(&self) -> bool {
        warn!("Real-Debrid rejected the access token; automatic refresh is not configured, update the API key in settings");
        false
    }

    pub async fn user(&self) -> Result<Value, DebridError> {
        self.request(Method::GET, "/user", Payload::Empty).await
    }

    pub async fn unrestrict_link(&self, link: &str) -> Result<Value, DebridError> {
        self.request(
            Method::POST,
            "/unrestrict/link",
            Payload::Form(vec![("link", link.to_string())]),
        )
        .await
    }

    pub async fn traffic(&self) -> Result<Value, DebridError> {
        self.request(Method::GET, "/traffic", Payload::Empty).await
    }

    pub async fn traffic_details(&self) -> Result<Value, DebridError> {
        self.request(Method::GET, "/traffic/details", Payload::Empty)
            .await
    }

    pub async fn streaming_transcode(&self, id: &str) -> Result<Value, DebridError> {
        self.request(
            Method::GET,
            &format!("/streaming/transcode/{id}"),
            Payload::Empty,
        )
        .await
    }

    pub async fn streaming_media_infos(&self, id: &str) -> Result<Value, DebridError> {
        self.request(
            Method::GET,
            &format!("/streaming/mediaInfos/{id}"),
            Payload::Empty,
        )
        .await
    }

    pub async fn downloads(&self) -> Result<Value, DebridError> {
        self.request(Method::GET, "/downloads", Payload::Empty)
            .await
    }

    pub async fn delete_download(&self, id: &str) -> Result<Value, DebridError> {
        self.request(
            Method::DELETE,
            &format!("/downloads/delete/{id}"),
            Payload::Empty,
        )
        .await
    }

    pub async fn torrents(&self) -> Result<Value, DebridError> {
        self.request(Method::GET, "/torrents", Payload::Empty).await
    }

    /// The torrent list parsed down to the fields the duplicate check needs.
    pub async fn torrent_summaries(&self) -> Result<Vec<TorrentSummary>, DebridError> {
        let value = self.torrents().await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn torrent_info(&self, id: &str) -> Result<Value, DebridError> {
        self.request(Method::GET, &format!("/torrents/info/{id}"), Payload::Empty)
            .await
    }

    pub async fn instant_availability(&self, hash: &str) -> Result<Value, DebridError> {
        self.request(
            Method::GET,
            &format!("/torrents/instantAvailability/{hash}"),
            Payload::Empty,
        )
        .await
    }

    pub async fn active_count(&self) -> Result<Value, DebridError> {
        self.request(Method::GET, "/torrents/activeCount", Payload::Empty)
            .await
    }

    pub async fn available_hosts(&self) -> Result<Value, DebridError> {
        self.request(Method::GET, "/torrents/availableHosts", Payload::Empty)
            .await
    }

    pub async fn add_magnet(&self, magnet: &str) -> Result<AddedMagnet, DebridError> {
        let value = self
            .request(
                Method::POST,
                "/torrents/addMagnet",
                Payload::Form(vec![("magnet", magnet.to_string())]),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn select_files(&self, id: &str, files: &str) -> Result<Value, DebridError> {
        self.request(
            Method::POST,
            &format!("/torrents/selectFiles/{id}"),
            Payload::Form(vec![("files", files.to_string())]),
        )
        .await
    }

    pub async fn delete_torrent(&self, id: &str) -> Result<Value, DebridError> {
        self.request(
            Method::DELETE,
            &format!("/torrents/delete/{id}"),
            Payload::Empty,
        )
        .await
    }

    pub async fn hosts(&self) -> Result<Value, DebridError> {
        self.request(Method::GET, "/hosts", Payload::Empty).await
    }

    pub async fn hosts_status(&self) -> Result<Value, DebridError> {
        self.request(Method::GET, "/hosts/status", Payload::Empty)
            .await
    }

    pub async fn user_settings(&self) -> Result<Value, DebridError> {
        self.request(Method::GET, "/settings", Payload::Empty).await
    }

    pub async fn update_user_settings(&self, name: &str, value: &str) -> Result<Value, DebridError> {
        self.request(
            Method::POST,
            "/settings/update",
            Payload::Form(vec![
                ("setting_name", name.to_string()),
                ("setting_value", value.to_string()),
            ]),
        )
        .await
    }

    pub async fn avatar_upload(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<Value, DebridError> {
        self.request(
            Method::PUT,
            "/settings/avatarFile",
            Payload::Raw {
                bytes,
                content_type: content_type.to_string(),
            },
        )
        .await
    }

    pub async fn avatar_delete(&self) -> Result<Value, DebridError> {
        self.request(Method::DELETE, "/settings/avatarDelete", Payload::Empty)
            .await
    }

    pub async fn server_time(&self) -> Result<Value, DebridError> {
        self.request(Method::GET, "/time", Payload::Empty).await
    }

    pub async fn server_time_iso(&self) -> Result<Value, DebridError> {
        self.request(Method::GET, "/time/iso", Payload::Empty).await
    }

    pub async fn disable_access_token(&self) -> Result<Value, DebridError> {
        self.request(Method::GET, "/disable_access_token", Payload::Empty)
            .await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        payload: Payload,
    ) -> Result<Value, DebridError> {
        let api_key = self.settings.rd_api_key().await;
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(DebridError::MissingApiKey);
        }

        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url).bearer_auth(api_key);
        request = match payload {
            Payload::Empty => request,
            Payload::Form(fields) => request.form(&fields),
            Payload::Raw {
                bytes,
                content_type,
            } => request
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes),
        };

        let response = request.send().await?;
        let status = response.status();

        match status {
            StatusCode::OK | StatusCode::CREATED => {
                let text = response.text().await?;
                if text.trim().is_empty() {
                    return Ok(Value::Null);
                }
                match serde_json::from_str(&text) {
                    Ok(value) => Ok(value),
                    // /time and /time/iso answer with a bare string.
                    Err(_) => Ok(Value::String(text.trim().to_string())),
                }
            }
            StatusCode::NO_CONTENT => Ok(Value::Null),
            StatusCode::UNAUTHORIZED => Err(DebridError::AuthExpired),
            StatusCode::NOT_FOUND => Err(DebridError::NotFound),
            StatusCode::TOO_MANY_REQUESTS => Err(DebridError::Unavailable { status }),
            status if status.is_server_error() => Err(DebridError::Unavailable { status }),
            status => {
                let detail = response.text().await.unwrap_or_default();
                Err(DebridError::Upstream {
                    status,
                    detail: truncate(&detail, 200),
                })
            }
        }
    }
}

/// Shortens an error body to roughly `max` bytes, backing up to the nearest
/// character boundary so multi-byte text never splits mid-character.
fn truncate(input: &str, max: usize) -> String {
    if input.len() <= max {
        return input.to_string();
    }
    let mut end = max;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}
