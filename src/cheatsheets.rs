//! Cheatsheet store: uploaded text files with an id → filename index
//!
//! Content lives in `{storage_dir}/{id}.txt`, rendered HTML in
//! `{storage_dir}/{id}.html`. The metadata file is the authoritative index;
//! every id in it has a content file, but a content file without metadata is
//! still served.

use crate::config::CheatsheetStoreConfig;
use crate::error::{json_error_response, ApiError};
use crate::server::{
    attachment_response, json_value_response, path_param, read_body, Handler, HttpResponse,
};
use crate::storage;
use chrono::{DateTime, Utc};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Multipart field carrying the upload
pub const UPLOAD_FIELD: &str = "file";

const HTML_TEMPLATE_HEAD: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>Cheatsheet</title>
</head>
<body>
    <h1>Cheatsheet</h1>
    <p>Exported from the stream overlay cheatsheet store.</p>
    <pre>"#;

const HTML_TEMPLATE_TAIL: &str = r#"</pre>
</body>
</html>
"#;

/// Metadata kept for each cheatsheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheatsheetMeta {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
}

type Metadata = BTreeMap<String, CheatsheetMeta>;

/// Entry returned by the listing endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheatsheetSummary {
    pub id: String,
    pub filename: String,
}

/// Escape HTML special characters
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Wrap cheatsheet content in the fixed HTML page
pub fn render_html(content: &str, escape: bool) -> String {
    let body = if escape {
        escape_html(content)
    } else {
        content.to_string()
    };
    let mut html =
        String::with_capacity(HTML_TEMPLATE_HEAD.len() + body.len() + HTML_TEMPLATE_TAIL.len());
    html.push_str(HTML_TEMPLATE_HEAD);
    html.push_str(&body);
    html.push_str(HTML_TEMPLATE_TAIL);
    html
}

/// Ids arrive from URL paths; anything that could leave the storage directory is unknown
fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(['/', '\\']) && !id.contains("..")
}

/// A parsed upload
#[derive(Debug)]
pub struct Upload {
    pub filename: String,
    pub data: Bytes,
}

/// Extract the `file` part from a multipart body
pub async fn parse_upload(content_type: Option<&str>, body: Bytes) -> Result<Upload, ApiError> {
    let boundary = content_type
        .and_then(|ct| multer::parse_boundary(ct).ok())
        .ok_or_else(|| ApiError::Validation("No file part".to_string()))?;

    let stream = futures::stream::once(async move { Ok::<Bytes, std::convert::Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("Invalid multipart content: {}", e)))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        // A part without a filename parameter is a form value, not a file
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        if filename.is_empty() {
            return Err(ApiError::Validation("No selected file".to_string()));
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::Validation(format!("Invalid multipart content: {}", e)))?;
        return Ok(Upload { filename, data });
    }

    Err(ApiError::Validation("No file part".to_string()))
}

/// File-backed cheatsheet store
pub struct CheatsheetStore {
    storage_dir: PathBuf,
    metadata_path: PathBuf,
    escape_html: bool,
    metadata_lock: Mutex<()>,
}

impl CheatsheetStore {
    pub fn new(config: &CheatsheetStoreConfig) -> Self {
        Self {
            storage_dir: config.storage_dir.clone(),
            metadata_path: config.metadata_file.clone(),
            escape_html: config.escape_html,
            metadata_lock: Mutex::new(()),
        }
    }

    fn content_path(&self, id: &str) -> PathBuf {
        self.storage_dir.join(format!("{}.txt", id))
    }

    fn html_path(&self, id: &str) -> PathBuf {
        self.storage_dir.join(format!("{}.html", id))
    }

    async fn load_metadata(&self) -> Result<Metadata, ApiError> {
        Ok(storage::load_json(&self.metadata_path).await?.unwrap_or_default())
    }

    /// Store new content and index it, returning the generated id
    pub async fn upload(&self, filename: &str, data: &[u8]) -> Result<String, ApiError> {
        tokio::fs::create_dir_all(&self.storage_dir).await?;

        let id = Uuid::new_v4().to_string();
        tokio::fs::write(self.content_path(&id), data).await?;

        let _guard = self.metadata_lock.lock().await;
        let mut metadata = self.load_metadata().await?;
        metadata.insert(
            id.clone(),
            CheatsheetMeta {
                filename: filename.to_string(),
                uploaded_at: Some(Utc::now()),
            },
        );
        let bytes = storage::to_json_pretty(&metadata)?;
        storage::write_atomic_async(self.metadata_path.clone(), bytes).await?;

        info!(id = %id, filename, size = data.len(), "Cheatsheet uploaded");
        Ok(id)
    }

    /// All indexed cheatsheets, ordered by id
    pub async fn list(&self) -> Result<Vec<CheatsheetSummary>, ApiError> {
        let metadata = self.load_metadata().await?;
        Ok(metadata
            .into_iter()
            .map(|(id, meta)| CheatsheetSummary {
                id,
                filename: meta.filename,
            })
            .collect())
    }

    /// Content of a stored cheatsheet; only the content file is consulted
    pub async fn content(&self, id: &str) -> Result<String, ApiError> {
        if !is_valid_id(id) {
            return Err(not_found());
        }
        match tokio::fs::read(self.content_path(id)).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }

    /// Render the cheatsheet to HTML, (re)writing `{id}.html` on every call
    pub async fn render(&self, id: &str) -> Result<String, ApiError> {
        let content = self.content(id).await?;
        let html = render_html(&content, self.escape_html);
        tokio::fs::write(self.html_path(id), html.as_bytes()).await?;
        debug!(id, escaped = self.escape_html, "Cheatsheet rendered to HTML");
        Ok(html)
    }
}

fn not_found() -> ApiError {
    ApiError::NotFound("Cheatsheet not found".to_string())
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    status: &'static str,
    message: &'static str,
    id: String,
}

#[derive(Debug, Serialize)]
struct ContentResponse {
    status: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    cheatsheets: Vec<CheatsheetSummary>,
}

/// HTTP front of the cheatsheet store
pub struct CheatsheetService {
    store: CheatsheetStore,
    max_body_bytes: u64,
}

impl CheatsheetService {
    pub fn new(store: CheatsheetStore, max_body_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            store,
            max_body_bytes,
        })
    }

    async fn upload(&self, req: Request<Incoming>) -> Result<HttpResponse, ApiError> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = read_body(req, self.max_body_bytes).await?;
        let upload = parse_upload(content_type.as_deref(), body).await?;

        let id = self.store.upload(&upload.filename, &upload.data).await?;
        Ok(json_value_response(
            StatusCode::OK,
            &UploadResponse {
                status: "success",
                message: "File uploaded successfully",
                id,
            },
        ))
    }

    async fn list(&self) -> Result<HttpResponse, ApiError> {
        let cheatsheets = self.store.list().await?;
        Ok(json_value_response(StatusCode::OK, &ListResponse { cheatsheets }))
    }

    async fn get(&self, id: &str) -> Result<HttpResponse, ApiError> {
        let content = self.store.content(id).await?;
        Ok(json_value_response(
            StatusCode::OK,
            &ContentResponse {
                status: "success",
                content,
            },
        ))
    }

    async fn download_html(&self, id: &str) -> Result<HttpResponse, ApiError> {
        let html = self.store.render(id).await?;
        Ok(attachment_response(
            "text/html; charset=utf-8",
            &format!("{}.html", id),
            html,
        ))
    }
}

impl Handler for CheatsheetService {
    fn name(&self) -> &'static str {
        "cheatsheets"
    }

    async fn handle(self: Arc<Self>, req: Request<Incoming>) -> HttpResponse {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let result = match (method, path.as_str()) {
            (Method::POST, "/upload_cheatsheet" | "/cheatsheets") => self.upload(req).await,
            (Method::GET, "/list_cheatsheets" | "/cheatsheets") => self.list().await,
            (Method::GET, path) => {
                let html_id = path_param(path, "/download_cheatsheet_html/", "")
                    .or_else(|| path_param(path, "/cheatsheets/", "/html"));
                let content_id = path_param(path, "/get_cheatsheet/", "")
                    .or_else(|| path_param(path, "/cheatsheets/", ""));
                match (html_id, content_id) {
                    (Some(id), _) => self.download_html(id).await,
                    (None, Some(id)) => self.get(id).await,
                    (None, None) => Err(ApiError::NotFound("not found".to_string())),
                }
            }
            _ => Err(ApiError::NotFound("not found".to_string())),
        };

        result.unwrap_or_else(|e| {
            if e.is_server_fault() {
                error!(error = %e, %path, "Cheatsheet request failed");
            }
            json_error_response(&e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BOUNDARY: &str = "X-OVERLAY-BOUNDARY";

    fn store_in(tmp: &TempDir) -> CheatsheetStore {
        CheatsheetStore::new(&CheatsheetStoreConfig::in_dir(tmp.path()))
    }

    fn multipart_body(field: &str, filename: Option<&str>, content: &str) -> Bytes {
        let disposition = match filename {
            Some(name) => format!("form-data; name=\"{}\"; filename=\"{}\"", field, name),
            None => format!("form-data; name=\"{}\"", field),
        };
        Bytes::from(format!(
            "--{b}\r\nContent-Disposition: {d}\r\nContent-Type: text/plain\r\n\r\n{c}\r\n--{b}--\r\n",
            b = BOUNDARY,
            d = disposition,
            c = content
        ))
    }

    fn content_type() -> String {
        format!("multipart/form-data; boundary={}", BOUNDARY)
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<script>&\"x\"'</script>"),
            "&lt;script&gt;&amp;&quot;x&quot;&#39;&lt;/script&gt;"
        );
        assert_eq!(escape_html("plain text"), "plain text");
    }

    #[test]
    fn test_render_html_wraps_content_in_pre() {
        let html = render_html("hello", true);
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<title>Cheatsheet</title>"));
        assert!(html.contains("<h1>Cheatsheet</h1>"));
        assert!(html.contains("<pre>hello</pre>"));
    }

    #[test]
    fn test_render_html_escaping_toggle() {
        let escaped = render_html("a < b && c", true);
        assert!(escaped.contains("<pre>a &lt; b &amp;&amp; c</pre>"));

        let raw = render_html("<b>bold</b>", false);
        assert!(raw.contains("<pre><b>bold</b></pre>"));
    }

    #[test]
    fn test_is_valid_id() {
        assert!(is_valid_id("0d5e6b3c-5a43-4a09-9f8e-2f1f0f6d8c1a"));
        assert!(is_valid_id("does-not-exist"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id(".."));
        assert!(!is_valid_id("../secret"));
        assert!(!is_valid_id("a\\b"));
    }

    #[tokio::test]
    async fn test_parse_upload() {
        let upload = parse_upload(
            Some(&content_type()),
            multipart_body("file", Some("notes.txt"), "hello"),
        )
        .await
        .unwrap();
        assert_eq!(upload.filename, "notes.txt");
        assert_eq!(upload.data, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_parse_upload_errors() {
        let missing_part = parse_upload(
            Some(&content_type()),
            multipart_body("other", Some("notes.txt"), "hello"),
        )
        .await
        .unwrap_err();
        assert_eq!(missing_part.to_string(), "No file part");

        let not_a_file = parse_upload(Some(&content_type()), multipart_body("file", None, "hello"))
            .await
            .unwrap_err();
        assert_eq!(not_a_file.to_string(), "No file part");

        let empty_name = parse_upload(
            Some(&content_type()),
            multipart_body("file", Some(""), "hello"),
        )
        .await
        .unwrap_err();
        assert_eq!(empty_name.to_string(), "No selected file");

        let no_boundary = parse_upload(Some("application/json"), Bytes::from("{}"))
            .await
            .unwrap_err();
        assert_eq!(no_boundary.status_code(), StatusCode::BAD_REQUEST);

        let no_header = parse_upload(None, Bytes::new()).await.unwrap_err();
        assert_eq!(no_header.to_string(), "No file part");
    }

    #[tokio::test]
    async fn test_upload_then_read_and_list() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);

        let id = store.upload("notes.txt", b"hello").await.unwrap();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(store.content(&id).await.unwrap(), "hello");

        let listed = store.list().await.unwrap();
        assert_eq!(
            listed,
            vec![CheatsheetSummary {
                id: id.clone(),
                filename: "notes.txt".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_metadata_records_upload_time() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let id = store.upload("a.txt", b"a").await.unwrap();

        let metadata = store.load_metadata().await.unwrap();
        assert!(metadata.get(&id).unwrap().uploaded_at.is_some());
    }

    #[tokio::test]
    async fn test_metadata_without_timestamp_still_loads() {
        let tmp = TempDir::new().unwrap();
        let config = CheatsheetStoreConfig::in_dir(tmp.path());
        std::fs::write(&config.metadata_file, r#"{"abc": {"filename": "old.txt"}}"#).unwrap();

        let store = CheatsheetStore::new(&config);
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].filename, "old.txt");
    }

    #[tokio::test]
    async fn test_content_without_metadata_is_served() {
        let tmp = TempDir::new().unwrap();
        let config = CheatsheetStoreConfig::in_dir(tmp.path());
        std::fs::create_dir_all(&config.storage_dir).unwrap();
        std::fs::write(config.storage_dir.join("orphan.txt"), "orphaned").unwrap();

        let store = CheatsheetStore::new(&config);
        assert_eq!(store.content("orphan").await.unwrap(), "orphaned");
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found_and_creates_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);

        let err = store.content("does-not-exist").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = store.render("does-not-exist").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        assert!(!store.html_path("does-not-exist").exists());

        let err = store.content("../cheatsheets_metadata").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_render_writes_stable_html_file() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let id = store.upload("notes.txt", b"hello <world>").await.unwrap();

        let first = store.render(&id).await.unwrap();
        let on_disk = std::fs::read_to_string(store.html_path(&id)).unwrap();
        assert_eq!(first, on_disk);
        assert!(first.contains("<pre>hello &lt;world&gt;</pre>"));

        let second = store.render(&id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(store.html_path(&id)).unwrap(), on_disk);
    }

    #[tokio::test]
    async fn test_concurrent_uploads_keep_all_metadata() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(store_in(&tmp));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .upload(&format!("sheet{}.txt", i), b"content")
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.list().await.unwrap().len(), 8);
    }
}
