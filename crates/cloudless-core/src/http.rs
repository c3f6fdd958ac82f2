//! HTTP adapter for the relay service.
//!
//! Every request goes to `{server}/api/...` with a bearer token and the
//! configured timeout. HTTP 429 is retried with exponential backoff up to
//! [`RetryConfig::max_retries`] and then surfaced as
//! [`ApiError::RateLimited`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::api::{
    ChunkUploadAck, CreateRoomRequest, DownloadedBlob, InitTransferRequest, JoinRoomRequest,
    RoomApi, RoomInfo, TransferApi, TransferInfo, UserInfo,
};
use crate::config::{RetryConfig, SessionConfig};
use crate::error::ApiError;

/// Header carrying the filename nonce on downloads.
pub const TRANSFER_NONCE_HEADER: &str = "x-transfer-nonce";

/// Relay client over HTTP.
#[derive(Clone)]
pub struct HttpApi {
    client: Client,
    base: Url,
    token: String,
    retry: RetryConfig,
}

impl HttpApi {
    /// Client for the relay at `server_url` (e.g. `https://relay.example`).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidRequest`] if the URL cannot be used as a
    /// base, or the HTTP client cannot be built.
    pub fn new(
        server_url: &str,
        token: impl Into<String>,
        config: &SessionConfig,
    ) -> Result<Self, ApiError> {
        let mut base =
            Url::parse(server_url).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        base.path_segments_mut()
            .map_err(|()| ApiError::InvalidRequest(format!("not a base URL: {server_url}")))?
            .pop_if_empty()
            .push("api");

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            base,
            token: token.into(),
            retry: config.retry.clone(),
        })
    }

    /// URL for the given path segments below `/api`.
    #[must_use]
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        self.client
            .request(method, self.endpoint(segments))
            .bearer_auth(&self.token)
    }

    /// Send the request built by `make`, retrying while rate limited.
    async fn execute<F>(&self, make: F) -> Result<Response, ApiError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            let response = make().send().await.map_err(map_reqwest)?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return check(response).await;
            }

            let hint = retry_after(response.headers());
            if attempt >= self.retry.max_retries {
                tracing::warn!(url = %response.url(), attempt, "rate limited, giving up");
                return Err(ApiError::RateLimited { retry_after: hint });
            }
            let delay = self.retry.backoff_duration(attempt, hint);
            tracing::debug!(url = %response.url(), attempt, ?delay, "rate limited, backing off");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn json<T, F>(&self, make: F) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let response = self.execute(make).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

impl std::fmt::Debug for HttpApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpApi")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RoomApi for HttpApi {
    async fn current_user(&self) -> Result<UserInfo, ApiError> {
        self.json(|| self.request(Method::GET, &["auth", "me"]))
            .await
    }

    async fn create_room(&self, request: &CreateRoomRequest) -> Result<RoomInfo, ApiError> {
        self.json(|| self.request(Method::POST, &["rooms"]).json(request))
            .await
    }

    async fn join_room(&self, request: &JoinRoomRequest) -> Result<RoomInfo, ApiError> {
        self.json(|| self.request(Method::POST, &["rooms", "join"]).json(request))
            .await
    }

    async fn get_room(&self, room_id: &str) -> Result<RoomInfo, ApiError> {
        self.json(|| self.request(Method::GET, &["rooms", room_id]))
            .await
    }

    async fn leave_room(&self, room_id: &str) -> Result<(), ApiError> {
        self.execute(|| self.request(Method::POST, &["rooms", room_id, "leave"]))
            .await
            .map(drop)
    }
}

#[async_trait]
impl TransferApi for HttpApi {
    async fn init_transfer(&self, request: &InitTransferRequest) -> Result<TransferInfo, ApiError> {
        if request.file_size == 0 {
            return Err(ApiError::InvalidRequest("file_size must be positive".into()));
        }
        self.json(|| self.request(Method::POST, &["transfers"]).json(request))
            .await
    }

    async fn upload_chunk(
        &self,
        transfer_id: &str,
        chunk_index: u64,
        sealed: Vec<u8>,
    ) -> Result<ChunkUploadAck, ApiError> {
        let index = chunk_index.to_string();
        self.json(|| {
            let part = Part::bytes(sealed.clone()).file_name(format!("chunk_{index}"));
            self.request(Method::POST, &["transfers", transfer_id, "chunks", &index])
                .multipart(Form::new().part("chunk", part))
        })
        .await
    }

    async fn download(&self, transfer_id: &str) -> Result<DownloadedBlob, ApiError> {
        let response = self
            .execute(|| self.request(Method::GET, &["transfers", transfer_id, "download"]))
            .await?;
        let nonce = response
            .headers()
            .get(TRANSFER_NONCE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(map_reqwest)?;
        Ok(DownloadedBlob {
            bytes: bytes.to_vec(),
            nonce,
        })
    }

    async fn list_transfers(&self, room_id: &str) -> Result<Vec<TransferInfo>, ApiError> {
        self.json(|| self.request(Method::GET, &["transfers", "room", room_id]))
            .await
    }

    async fn cancel_transfer(&self, transfer_id: &str) -> Result<(), ApiError> {
        self.execute(|| self.request(Method::DELETE, &["transfers", transfer_id]))
            .await
            .map(drop)
    }
}

async fn check(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or(body);

    Err(match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
        StatusCode::FORBIDDEN => ApiError::Forbidden(message),
        StatusCode::NOT_FOUND => ApiError::NotFound(message),
        _ => ApiError::Status {
            status: status.as_u16(),
            message,
        },
    })
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn map_reqwest(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves canned responses, one per connection, and records request lines.
    async fn serve(responses: Vec<String>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);

        tokio::spawn(async move {
            for response in responses {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = sock.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let head = String::from_utf8_lossy(&buf).to_string();
                log.lock().unwrap().push(head);
                sock.write_all(response.as_bytes()).await.unwrap();
                sock.shutdown().await.ok();
            }
        });

        (format!("http://{addr}"), seen)
    }

    fn reply(status: &str, headers: &[(&str, &str)], body: &str) -> String {
        let mut out = format!("HTTP/1.1 {status}\r\nconnection: close\r\ncontent-length: {}\r\n", body.len());
        for (k, v) in headers {
            out.push_str(&format!("{k}: {v}\r\n"));
        }
        out.push_str("\r\n");
        out.push_str(body);
        out
    }

    fn config() -> SessionConfig {
        SessionConfig {
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                multiplier: 2.0,
            },
            ..SessionConfig::default()
        }
    }

    const ROOM: &str = r#"{"id":"r1","code":"ABC234","members":[]}"#;

    #[test]
    fn test_endpoint_paths() {
        let api = HttpApi::new("https://relay.example/", "t", &config()).unwrap();
        assert_eq!(
            api.endpoint(&["transfers", "t1", "chunks", "3"]).as_str(),
            "https://relay.example/api/transfers/t1/chunks/3"
        );
        let api = HttpApi::new("https://relay.example/base", "t", &config()).unwrap();
        assert_eq!(
            api.endpoint(&["rooms", "join"]).as_str(),
            "https://relay.example/base/api/rooms/join"
        );
        assert!(HttpApi::new("not a url", "t", &config()).is_err());
    }

    #[tokio::test]
    async fn test_bearer_token_and_retry_on_429() {
        let (url, seen) = serve(vec![
            reply("429 Too Many Requests", &[("retry-after", "0")], ""),
            reply("200 OK", &[("content-type", "application/json")], ROOM),
        ])
        .await;

        let api = HttpApi::new(&url, "secret-token", &config()).unwrap();
        let room = api.get_room("r1").await.unwrap();
        assert_eq!(room.code, "ABC234");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].starts_with("GET /api/rooms/r1 "));
        assert!(seen[1].to_lowercase().contains("authorization: bearer secret-token"));
    }

    #[tokio::test]
    async fn test_rate_limit_surfaces_after_budget() {
        let limited = reply("429 Too Many Requests", &[("retry-after", "0")], "");
        let (url, seen) = serve(vec![limited.clone(), limited.clone(), limited]).await;

        let api = HttpApi::new(&url, "t", &config()).unwrap();
        let err = api.get_room("r1").await.unwrap_err();
        assert_eq!(
            err,
            ApiError::RateLimited {
                retry_after: Some(Duration::ZERO)
            }
        );
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let (url, _) = serve(vec![
            reply("404 Not Found", &[], r#"{"detail":"Room not found"}"#),
            reply("401 Unauthorized", &[], ""),
            reply("500 Internal Server Error", &[], "boom"),
        ])
        .await;
        let api = HttpApi::new(&url, "t", &config()).unwrap();

        assert_eq!(
            api.get_room("x").await.unwrap_err(),
            ApiError::NotFound("Room not found".into())
        );
        assert_eq!(api.get_room("x").await.unwrap_err(), ApiError::Unauthorized);
        let err = api.get_room("x").await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 500, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_download_reads_nonce_header() {
        let (url, _) = serve(vec![reply(
            "200 OK",
            &[("x-transfer-nonce", "bm9uY2U=")],
            "blob",
        )])
        .await;
        let api = HttpApi::new(&url, "t", &config()).unwrap();
        let blob = api.download("t1").await.unwrap();
        assert_eq!(blob.bytes, b"blob");
        assert_eq!(blob.nonce.as_deref(), Some("bm9uY2U="));
    }

    #[tokio::test]
    async fn test_empty_file_rejected_locally() {
        let api = HttpApi::new("http://127.0.0.1:9", "t", &config()).unwrap();
        let err = api
            .init_transfer(&InitTransferRequest {
                room_id: "r".into(),
                encrypted_filename: "f".into(),
                encrypted_mimetype: None,
                file_size: 0,
                nonce: "n".into(),
                mode: cloudless_files::TransferMode::Relay,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)));
    }
}
