//! Seoul open-API access for CUES: the paginated page fetcher and an
//! immutable raw-page archive.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cues_core::RawEvent;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cues-source";

/// Largest index-range width the source accepts in one request.
pub const SOURCE_MAX_PAGE_WIDTH: u32 = 1000;

pub const DEFAULT_BASE_URL: &str = "http://openapi.seoul.go.kr:8088";

const SERVICE_NAME: &str = "culturalEventInfo";
const RESULT_OK: &str = "INFO-000";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("source rejected range {start}-{end}: {code} {message}")]
    Api {
        start: u32,
        end: u32,
        code: String,
        message: String,
    },
    #[error("malformed response for range {start}-{end}: {reason}")]
    Malformed {
        start: u32,
        end: u32,
        reason: String,
    },
}

/// One decoded page plus the body bytes it was decoded from, kept so the
/// archive can store the payload exactly as received.
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    pub events: Vec<RawEvent>,
    pub body: Vec<u8>,
}

/// Paginated record source: one call fetches the raw records with 1-based
/// index in `[start, end]`.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn fetch_page(&self, start: u32, end: u32) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct OpenApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for OpenApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: "sample".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: "cues-bot/0.1".to_string(),
        }
    }
}

/// HTTP client for the `culturalEventInfo` service.
#[derive(Debug, Clone)]
pub struct OpenApiClient {
    client: reqwest::Client,
    config: OpenApiConfig,
}

impl OpenApiClient {
    pub fn new(config: OpenApiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    fn page_url(&self, start: u32, end: u32) -> String {
        format!(
            "{}/{}/json/{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.api_key,
            SERVICE_NAME,
            start,
            end
        )
    }
}

#[async_trait]
impl EventSource for OpenApiClient {
    async fn fetch_page(&self, start: u32, end: u32) -> Result<FetchedPage, FetchError> {
        let url = self.page_url(start, end);
        let span = info_span!("fetch_page", start, end);
        let _guard = span.enter();

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        let events = decode_page(&body, start, end)?;
        Ok(FetchedPage { events, body })
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "culturalEventInfo")]
    service: Option<ServiceBody>,
    #[serde(rename = "RESULT")]
    result: Option<ApiResult>,
}

#[derive(Debug, Deserialize)]
struct ServiceBody {
    #[serde(rename = "RESULT")]
    result: Option<ApiResult>,
    #[serde(rename = "row", default)]
    rows: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct ApiResult {
    #[serde(rename = "CODE", default)]
    code: String,
    #[serde(rename = "MESSAGE", default)]
    message: String,
}

/// Decode one response body into raw rows.
///
/// Error responses carry `RESULT` at the top level with no service body;
/// both that shape and a non-`INFO-000` result code inside the body are
/// surfaced as [`FetchError::Api`]. A single row of the wrong shape is
/// skipped with a warning rather than failing the page.
pub fn decode_page(body: &[u8], start: u32, end: u32) -> Result<Vec<RawEvent>, FetchError> {
    let envelope: Envelope =
        serde_json::from_slice(body).map_err(|err| FetchError::Malformed {
            start,
            end,
            reason: err.to_string(),
        })?;

    let Some(service) = envelope.service else {
        let (code, message) = envelope
            .result
            .map(|r| (r.code, r.message))
            .unwrap_or_else(|| {
                (
                    "UNKNOWN".to_string(),
                    format!("missing {SERVICE_NAME} body"),
                )
            });
        return Err(FetchError::Api {
            start,
            end,
            code,
            message,
        });
    };

    if let Some(result) = &service.result {
        if result.code != RESULT_OK {
            return Err(FetchError::Api {
                start,
                end,
                code: result.code.clone(),
                message: result.message.clone(),
            });
        }
    }

    let mut events = Vec::with_capacity(service.rows.len());
    for (index, row) in service.rows.into_iter().enumerate() {
        match serde_json::from_value::<RawEvent>(row) {
            Ok(event) => events.push(event),
            Err(err) => warn!(index, error = %err, "skipping undecodable row"),
        }
    }
    Ok(events)
}

#[derive(Debug, Clone)]
pub struct StoredPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw page bodies, written with an atomic
/// temp-file rename so a crashed run never leaves a partial artifact.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        start: u32,
        end: u32,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(format!("{start}-{end}"))
            .join(format!("{content_hash}.json"))
    }

    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        start: u32,
        end: u32,
        bytes: &[u8],
    ) -> anyhow::Result<StoredPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, start, end, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(StoredPage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredPage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredPage {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp archive file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE_BODY: &str = r#"{
        "culturalEventInfo": {
            "list_total_count": 4813,
            "RESULT": {"CODE": "INFO-000", "MESSAGE": "정상 처리되었습니다"},
            "row": [
                {
                    "CODENAME": "콘서트",
                    "GUNAME": "강남구",
                    "TITLE": "Spring Concert",
                    "PLACE": "코엑스",
                    "STRTDATE": "2025-05-08 00:00:00.0",
                    "END_DATE": "2025-05-09 00:00:00.0",
                    "LOT": "37.5111",
                    "LAT": "127.0590",
                    "IS_FREE": "유료"
                }
            ]
        }
    }"#;

    #[test]
    fn well_formed_page_decodes_to_rows() {
        let events = decode_page(PAGE_BODY.as_bytes(), 1, 1000).expect("decode");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title.as_deref(), Some("Spring Concert"));
        assert_eq!(events[0].category.as_deref(), Some("콘서트"));
        assert_eq!(events[0].lot.as_deref(), Some("37.5111"));
    }

    #[test]
    fn row_of_the_wrong_shape_is_skipped() {
        let body = r#"{
            "culturalEventInfo": {
                "RESULT": {"CODE": "INFO-000", "MESSAGE": "ok"},
                "row": [
                    {"TITLE": "Good Row"},
                    {"TITLE": ["not", "a", "string"]}
                ]
            }
        }"#;
        let events = decode_page(body.as_bytes(), 1, 2).expect("decode");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title.as_deref(), Some("Good Row"));
    }

    #[test]
    fn top_level_result_is_an_api_error() {
        let body = r#"{"RESULT": {"CODE": "INFO-200", "MESSAGE": "해당하는 데이터가 없습니다"}}"#;
        let err = decode_page(body.as_bytes(), 1001, 2000).expect_err("api error");
        match err {
            FetchError::Api { code, start, end, .. } => {
                assert_eq!(code, "INFO-200");
                assert_eq!((start, end), (1001, 2000));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn embedded_error_code_is_an_api_error() {
        let body = r#"{
            "culturalEventInfo": {
                "RESULT": {"CODE": "ERROR-500", "MESSAGE": "서버 오류"},
                "row": []
            }
        }"#;
        assert!(matches!(
            decode_page(body.as_bytes(), 1, 1000),
            Err(FetchError::Api { .. })
        ));
    }

    #[test]
    fn non_json_body_is_malformed() {
        assert!(matches!(
            decode_page(b"<html>gateway timeout</html>", 1, 1000),
            Err(FetchError::Malformed { .. })
        ));
    }

    #[test]
    fn page_url_has_the_service_shape() {
        let client = OpenApiClient::new(OpenApiConfig {
            api_key: "sample".to_string(),
            ..OpenApiConfig::default()
        })
        .expect("client");
        assert_eq!(
            client.page_url(1, 1000),
            "http://openapi.seoul.go.kr:8088/sample/json/culturalEventInfo/1/1000"
        );
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_bodies_by_hash() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2025-05-08T06:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_page(fetched_at, 1, 1000, PAGE_BODY.as_bytes())
            .await
            .expect("first store");
        let second = archive
            .store_page(fetched_at, 1, 1000, PAGE_BODY.as_bytes())
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }
}
