//! HTTP side of uploads
//!
//! The executor talks to the server only through [`UploadTransport`]; the
//! reqwest implementation below speaks the `/files/upload` and
//! `/files/multipart/*` endpoints with a bearer token.

use crate::models::Destination;
use crate::services::auth::AuthTokens;
use async_trait::async_trait;
use reqwest::header::ETAG;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors that can occur during an upload
#[derive(Debug)]
pub enum UploadError {
    /// No bearer token in local or session storage
    MissingToken,
    /// Non-2xx answer; `message` is the server's `{ error }` when present
    Http { status: u16, message: String },
    /// Connection could not be established or broke off
    Network(String),
    Timeout,
    /// 2xx answer without the expected fields
    InvalidResponse(String),
    /// The referenced bytes are gone (e.g. transient handle after restart)
    SourceUnavailable(String),
    IoError(std::io::Error),
    Cancelled,
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::MissingToken => write!(f, "Missing authentication token"),
            UploadError::Http { status, message } => write!(f, "HTTP {}: {}", status, message),
            UploadError::Network(e) => write!(f, "Network error: {}", e),
            UploadError::Timeout => write!(f, "Request timed out"),
            UploadError::InvalidResponse(e) => write!(f, "Invalid server response: {}", e),
            UploadError::SourceUnavailable(e) => write!(f, "Upload source unavailable: {}", e),
            UploadError::IoError(e) => write!(f, "IO error: {}", e),
            UploadError::Cancelled => write!(f, "Upload cancelled"),
        }
    }
}

impl std::error::Error for UploadError {}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::IoError(err)
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UploadError::Timeout
        } else if let Some(status) = err.status() {
            UploadError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            UploadError::InvalidResponse(err.to_string())
        } else {
            UploadError::Network(err.to_string())
        }
    }
}

/// A whole-file upload
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub destination: Destination,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultipartInit {
    pub filename: String,
    pub content_type: String,
    pub entity_id: String,
    pub media_type: String,
    pub total_chunks: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultipartSession {
    pub upload_id: String,
    /// One pre-authorised destination per chunk
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub e_tag: String,
}

#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Single request upload; returns the public URL
    async fn upload_file(&self, request: FileUpload) -> UploadResult<String>;

    async fn init_multipart(&self, request: &MultipartInit) -> UploadResult<MultipartSession>;

    /// Sends one chunk; returns its integrity tag
    async fn upload_part(&self, url: &str, part_number: u32, bytes: Vec<u8>) -> UploadResult<String>;

    /// Finalises a multipart upload; returns the public URL
    async fn complete_multipart(&self, upload_id: &str, parts: &[CompletedPart]) -> UploadResult<String>;
}

/// Downloads images for PDF assembly
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> UploadResult<Vec<u8>>;
}

#[derive(Deserialize)]
struct UploadResponse {
    url: Option<String>,
    #[serde(rename = "publicUrl")]
    public_url: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteRequest<'a> {
    upload_id: &'a str,
    parts: &'a [CompletedPart],
}

/// reqwest based transport against the rental API
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    tokens: AuthTokens,
}

impl HttpTransport {
    pub fn new(base_url: &str, tokens: AuthTokens, timeout: Duration) -> UploadResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    async fn bearer(&self) -> UploadResult<String> {
        self.tokens.token().await.ok_or(UploadError::MissingToken)
    }

    async fn check(response: reqwest::Response) -> UploadResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|body| body.error.or(body.message))
            .unwrap_or_else(|| {
                if text.is_empty() {
                    status.canonical_reason().unwrap_or("error").to_string()
                } else {
                    text.chars().take(200).collect()
                }
            });

        Err(UploadError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn upload_file(&self, request: FileUpload) -> UploadResult<String> {
        let token = self.bearer().await?;
        let size = request.bytes.len();

        let part = reqwest::multipart::Part::bytes(request.bytes)
            .file_name(request.filename.clone())
            .mime_str(&request.content_type)?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("type", request.destination.record_type.clone())
            .text("entityId", request.destination.entity_id.clone())
            .text("protocolType", request.destination.protocol_type.clone())
            .text("mediaType", request.destination.media_type.clone());

        let response = self
            .client
            .post(format!("{}/files/upload", self.base_url))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;
        let body: UploadResponse = Self::check(response).await?.json().await?;

        let url = body.url.or(body.public_url).ok_or_else(|| {
            UploadError::InvalidResponse("response carries neither url nor publicUrl".to_string())
        })?;
        log::debug!("Uploaded {} ({} bytes) -> {}", request.filename, size, url);
        Ok(url)
    }

    async fn init_multipart(&self, request: &MultipartInit) -> UploadResult<MultipartSession> {
        let token = self.bearer().await?;
        let response = self
            .client
            .post(format!("{}/files/multipart/init", self.base_url))
            .bearer_auth(token)
            .json(request)
            .send()
            .await?;
        let session: MultipartSession = Self::check(response).await?.json().await?;
        log::debug!(
            "Multipart upload {} started for {} ({} chunks)",
            session.upload_id,
            request.filename,
            request.total_chunks
        );
        Ok(session)
    }

    async fn upload_part(&self, url: &str, part_number: u32, bytes: Vec<u8>) -> UploadResult<String> {
        // Chunk URLs are pre-authorised, no bearer header
        let response = self.client.put(url).body(bytes).send().await?;
        let response = Self::check(response).await?;
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
            .ok_or_else(|| {
                UploadError::InvalidResponse(format!("part {} returned no ETag", part_number))
            })?;
        Ok(etag)
    }

    async fn complete_multipart(&self, upload_id: &str, parts: &[CompletedPart]) -> UploadResult<String> {
        let token = self.bearer().await?;
        let response = self
            .client
            .post(format!("{}/files/multipart/complete", self.base_url))
            .bearer_auth(token)
            .json(&CompleteRequest { upload_id, parts })
            .send()
            .await?;
        let body: UploadResponse = Self::check(response).await?.json().await?;
        body.url.or(body.public_url).ok_or_else(|| {
            UploadError::InvalidResponse("multipart completion returned no url".to_string())
        })
    }
}

#[async_trait]
impl ImageFetcher for HttpTransport {
    async fn fetch(&self, url: &str) -> UploadResult<Vec<u8>> {
        let mut request = self.client.get(url);
        if let Some(token) = self.tokens.token().await {
            request = request.bearer_auth(token);
        }
        let response = Self::check(request.send().await?).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Debug, Clone)]
    pub(crate) struct RecordedRequest {
        pub method: String,
        pub path: String,
        pub headers: HashMap<String, String>,
        pub body: Vec<u8>,
    }

    pub(crate) struct MockResponse {
        pub status: u16,
        pub headers: Vec<(String, String)>,
        pub body: String,
    }

    impl MockResponse {
        pub fn json(status: u16, body: &str) -> Self {
            Self {
                status,
                headers: Vec::new(),
                body: body.to_string(),
            }
        }
    }

    fn header_end_offset(buffer: &[u8]) -> Option<usize> {
        buffer.windows(4).position(|window| window == b"\r\n\r\n")
    }

    async fn read_http_request(stream: &mut tokio::net::TcpStream) -> Option<RecordedRequest> {
        let mut buffer = Vec::new();
        loop {
            let mut chunk = [0_u8; 4096];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            buffer.extend_from_slice(&chunk[..read]);
            if header_end_offset(&buffer).is_some() {
                break;
            }
        }

        let header_end = header_end_offset(&buffer)?;
        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let mut lines = head.lines();
        let request_line = lines.next()?.to_string();
        let mut parts = request_line.split_whitespace();
        let method = parts.next()?.to_string();
        let path = parts.next()?.to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let content_length = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);

        let mut body = buffer[header_end + 4..].to_vec();
        while body.len() < content_length {
            let mut chunk = [0_u8; 4096];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }

        Some(RecordedRequest {
            method,
            path,
            headers,
            body,
        })
    }

    fn status_text(status: u16) -> &'static str {
        match status {
            200 => "OK",
            201 => "Created",
            400 => "Bad Request",
            404 => "Not Found",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            _ => "Error",
        }
    }

    async fn write_http_response(
        stream: &mut tokio::net::TcpStream,
        response: &MockResponse,
    ) -> std::io::Result<()> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
            response.status,
            status_text(response.status),
            response.body.len()
        );
        for (name, value) in &response.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(response.body.as_bytes()).await?;
        stream.flush().await
    }

    /// Serves requests forever, answering via `route`. Returns the base URL
    /// and the log of received requests.
    pub(crate) async fn spawn_mock_server<F>(route: F) -> (String, Arc<Mutex<Vec<RecordedRequest>>>)
    where
        F: Fn(&RecordedRequest, &str) -> MockResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let log = Arc::new(Mutex::new(Vec::new()));

        let route = Arc::new(route);
        let requests = log.clone();
        let server_base = base.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let route = route.clone();
                let requests = requests.clone();
                let server_base = server_base.clone();
                tokio::spawn(async move {
                    if let Some(request) = read_http_request(&mut stream).await {
                        let response = route(&request, &server_base);
                        requests.lock().unwrap().push(request);
                        let _ = write_http_response(&mut stream, &response).await;
                    }
                });
            }
        });

        (base, log)
    }

    fn tokens_with(token: Option<&str>) -> AuthTokens {
        let tokens = AuthTokens::new(None);
        tokens.set_session_token(token.map(|t| t.to_string()));
        tokens
    }

    fn upload(bytes: &[u8]) -> FileUpload {
        FileUpload {
            filename: "front.webp".to_string(),
            content_type: "image/webp".to_string(),
            bytes: bytes.to_vec(),
            destination: Destination::protocol("p-42", "vehicle"),
        }
    }

    #[tokio::test]
    async fn test_upload_file_sends_form_and_reads_public_url() {
        let (base, log) = spawn_mock_server(|request, _| match request.path.as_str() {
            "/files/upload" => MockResponse::json(200, r#"{"publicUrl":"https://cdn/p-42/front.webp"}"#),
            _ => MockResponse::json(404, r#"{"error":"no route"}"#),
        })
        .await;

        let transport =
            HttpTransport::new(&base, tokens_with(Some("secret")), Duration::from_secs(5)).unwrap();
        let url = transport.upload_file(upload(b"RIFF0000WEBP")).await.unwrap();
        assert_eq!(url, "https://cdn/p-42/front.webp");

        let requests = log.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.headers.get("authorization").map(String::as_str), Some("Bearer secret"));
        let body = String::from_utf8_lossy(&request.body);
        assert!(body.contains("name=\"entityId\""));
        assert!(body.contains("p-42"));
        assert!(body.contains("name=\"mediaType\""));
        assert!(body.contains("filename=\"front.webp\""));
    }

    #[tokio::test]
    async fn test_server_error_carries_status_and_message() {
        let (base, _) = spawn_mock_server(|_, _| MockResponse::json(503, r#"{"error":"maintenance"}"#)).await;
        let transport =
            HttpTransport::new(&base, tokens_with(Some("secret")), Duration::from_secs(5)).unwrap();

        match transport.upload_file(upload(b"x")).await.unwrap_err() {
            UploadError::Http { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "maintenance");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_token_fails_without_request() {
        let (base, log) = spawn_mock_server(|_, _| MockResponse::json(200, "{}")).await;
        let transport = HttpTransport::new(&base, tokens_with(None), Duration::from_secs(5)).unwrap();

        let err = transport.upload_file(upload(b"x")).await.unwrap_err();
        assert!(matches!(err, UploadError::MissingToken));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_multipart_sequence() {
        let (base, log) = spawn_mock_server(|request, base| match (request.method.as_str(), request.path.as_str()) {
            ("POST", "/files/multipart/init") => MockResponse::json(
                200,
                &format!(r#"{{"uploadId":"up-1","urls":["{0}/chunk/1","{0}/chunk/2"]}}"#, base),
            ),
            ("PUT", path) if path.starts_with("/chunk/") => MockResponse {
                status: 200,
                headers: vec![("ETag".to_string(), format!("\"etag-{}\"", &path[7..]))],
                body: String::new(),
            },
            ("POST", "/files/multipart/complete") => {
                MockResponse::json(200, r#"{"url":"https://cdn/big.webp"}"#)
            }
            _ => MockResponse::json(404, "{}"),
        })
        .await;
        let transport =
            HttpTransport::new(&base, tokens_with(Some("secret")), Duration::from_secs(5)).unwrap();

        let session = transport
            .init_multipart(&MultipartInit {
                filename: "big.webp".into(),
                content_type: "image/webp".into(),
                entity_id: "p-42".into(),
                media_type: "vehicle".into(),
                total_chunks: 2,
            })
            .await
            .unwrap();
        assert_eq!(session.upload_id, "up-1");

        let mut parts = Vec::new();
        for (i, url) in session.urls.iter().enumerate() {
            let tag = transport.upload_part(url, i as u32 + 1, vec![i as u8; 16]).await.unwrap();
            parts.push(CompletedPart {
                part_number: i as u32 + 1,
                e_tag: tag,
            });
        }
        assert_eq!(parts[1].e_tag, "\"etag-2\"");

        let url = transport.complete_multipart(&session.upload_id, &parts).await.unwrap();
        assert_eq!(url, "https://cdn/big.webp");

        let requests = log.lock().unwrap();
        let init = requests.iter().find(|r| r.path == "/files/multipart/init").unwrap();
        let init_body: serde_json::Value = serde_json::from_slice(&init.body).unwrap();
        assert_eq!(init_body["totalChunks"], 2);
        assert_eq!(init_body["entityId"], "p-42");

        let complete = requests.iter().find(|r| r.path == "/files/multipart/complete").unwrap();
        let complete_body: serde_json::Value = serde_json::from_slice(&complete.body).unwrap();
        assert_eq!(complete_body["uploadId"], "up-1");
        assert_eq!(complete_body["parts"][0]["partNumber"], 1);
        assert_eq!(complete_body["parts"][0]["eTag"], "\"etag-1\"");
    }

    #[tokio::test]
    async fn test_fetch_maps_not_found() {
        let (base, _) = spawn_mock_server(|_, _| MockResponse::json(404, r#"{"error":"gone"}"#)).await;
        let transport = HttpTransport::new(&base, tokens_with(None), Duration::from_secs(5)).unwrap();
        let err = transport.fetch(&format!("{}/img.jpg", base)).await.unwrap_err();
        assert!(matches!(err, UploadError::Http { status: 404, .. }));
    }
}
