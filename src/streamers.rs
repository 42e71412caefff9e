//! Streamer list store: five named slots persisted to a single JSON file

use crate::config::StreamerStoreConfig;
use crate::error::ApiError;
use crate::server::{json_response, json_value_response, read_body, Handler, HttpResponse};
use crate::storage;
use hyper::body::Incoming;
use hyper::{Method, Request, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Number of fixed slots in the list
pub const SLOT_COUNT: usize = 5;

pub type Streamers = [String; SLOT_COUNT];

/// On-disk layout: `{"streamers": [...]}`
#[derive(Debug, Default, Serialize, Deserialize)]
struct StreamerFile {
    #[serde(default)]
    streamers: Vec<String>,
}

/// Merge requested values into the current list, slot by slot.
///
/// A slot takes the requested value when it is non-blank after trimming,
/// otherwise it keeps the current value.
pub fn merge(current: &Streamers, requested: &[String]) -> Streamers {
    std::array::from_fn(|i| match requested.get(i) {
        Some(value) if !value.trim().is_empty() => value.clone(),
        _ => current[i].clone(),
    })
}

/// Pad or truncate a stored list to exactly five slots
fn normalize(stored: Vec<String>) -> Streamers {
    let mut slots = stored.into_iter();
    std::array::from_fn(|_| slots.next().unwrap_or_default())
}

/// Parse an update body into its requested slot values
pub fn parse_update(body: &[u8]) -> Result<Vec<String>, ApiError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ApiError::Validation(format!("Invalid JSON: {}", e)))?;

    let object = value
        .as_object()
        .ok_or_else(|| ApiError::Validation("Invalid data format".to_string()))?;

    let Some(streamers) = object.get("streamers") else {
        return Ok(Vec::new());
    };

    streamers
        .as_array()
        .ok_or_else(|| ApiError::Validation("Invalid data format".to_string()))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| ApiError::Validation("Invalid data format".to_string()))
        })
        .collect()
}

/// File-backed streamer list
pub struct StreamerStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StreamerStore {
    pub fn new(config: &StreamerStoreConfig) -> Self {
        Self::at(config.file.clone())
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current list; all slots empty when nothing has been stored
    pub async fn load(&self) -> Result<Streamers, ApiError> {
        let stored: Option<StreamerFile> = storage::load_json(&self.path).await?;
        Ok(normalize(stored.unwrap_or_default().streamers))
    }

    /// Merge `requested` into the stored list and persist the result
    pub async fn update(&self, requested: &[String]) -> Result<Streamers, ApiError> {
        let _guard = self.write_lock.lock().await;

        let current = self.load().await?;
        let updated = merge(&current, requested);

        let file = StreamerFile {
            streamers: updated.to_vec(),
        };
        storage::write_atomic_async(self.path.clone(), storage::to_json_pretty(&file)?).await?;

        info!(path = %self.path.display(), streamers = ?updated, "Streamers updated");
        Ok(updated)
    }
}

#[derive(Debug, Serialize)]
struct ListResponse<'a> {
    streamers: &'a Streamers,
}

#[derive(Debug, Serialize)]
struct UpdateResponse<'a> {
    message: &'static str,
    streamers: &'a Streamers,
}

/// HTTP front of the streamer list
pub struct StreamerService {
    store: StreamerStore,
    max_body_bytes: u64,
}

impl StreamerService {
    pub fn new(store: StreamerStore, max_body_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            store,
            max_body_bytes,
        })
    }

    async fn get_streamers(&self) -> Result<HttpResponse, ApiError> {
        let streamers = self.store.load().await?;
        Ok(json_value_response(
            StatusCode::OK,
            &ListResponse {
                streamers: &streamers,
            },
        ))
    }

    async fn update_streamers(&self, req: Request<Incoming>) -> Result<HttpResponse, ApiError> {
        let body = read_body(req, self.max_body_bytes).await?;
        let requested = parse_update(&body)?;
        let streamers = self.store.update(&requested).await?;
        Ok(json_value_response(
            StatusCode::OK,
            &UpdateResponse {
                message: "Streamers updated successfully!",
                streamers: &streamers,
            },
        ))
    }
}

/// `{error}` body used by this service
fn error_response(error: &ApiError) -> HttpResponse {
    if error.is_server_fault() {
        error!(error = %error, "Streamer store failure");
    }
    let body = serde_json::json!({ "error": error.to_string() });
    json_response(error.status_code(), body.to_string())
}

impl Handler for StreamerService {
    fn name(&self) -> &'static str {
        "streamers"
    }

    async fn handle(self: Arc<Self>, req: Request<Incoming>) -> HttpResponse {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let result = match (&method, path.as_str()) {
            (&Method::GET, "/get_streamers" | "/streamers") => self.get_streamers().await,
            (&Method::POST, "/update_streamers" | "/streamers") => {
                self.update_streamers(req).await
            }
            _ => Err(ApiError::NotFound("not found".to_string())),
        };
        result.unwrap_or_else(|e| error_response(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn slots(values: [&str; SLOT_COUNT]) -> Streamers {
        values.map(str::to_string)
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_merge_prefers_non_blank_request() {
        let current = slots(["a", "b", "c", "", ""]);
        let merged = merge(&current, &strings(&["x", "", "  ", "y"]));
        assert_eq!(merged, slots(["x", "b", "c", "y", ""]));
    }

    #[test]
    fn test_merge_keeps_untrimmed_value() {
        let current = slots(["", "", "", "", ""]);
        let merged = merge(&current, &strings(&[" padded "]));
        assert_eq!(merged[0], " padded ");
    }

    #[test]
    fn test_merge_ignores_extra_entries() {
        let current = Streamers::default();
        let merged = merge(&current, &strings(&["1", "2", "3", "4", "5", "6"]));
        assert_eq!(merged, slots(["1", "2", "3", "4", "5"]));
    }

    #[test]
    fn test_normalize_pads_and_truncates() {
        assert_eq!(normalize(strings(&["a"])), slots(["a", "", "", "", ""]));
        assert_eq!(
            normalize(strings(&["1", "2", "3", "4", "5", "6"])),
            slots(["1", "2", "3", "4", "5"])
        );
    }

    #[test]
    fn test_parse_update() {
        assert_eq!(
            parse_update(br#"{"streamers": ["a", "b"]}"#).unwrap(),
            strings(&["a", "b"])
        );
        assert!(parse_update(br#"{}"#).unwrap().is_empty());

        let err = parse_update(br#"{"streamers": "a"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Invalid data format");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        assert!(parse_update(br#"{"streamers": [1, 2]}"#).is_err());
        assert!(parse_update(br#"["a"]"#).is_err());
        assert!(parse_update(b"not json").unwrap_err().to_string().starts_with("Invalid JSON"));
    }

    #[tokio::test]
    async fn test_load_without_file_is_all_empty() {
        let tmp = TempDir::new().unwrap();
        let store = StreamerStore::at(tmp.path().join("streamers.json"));
        assert_eq!(store.load().await.unwrap(), Streamers::default());
    }

    #[tokio::test]
    async fn test_update_persists_merged_list() {
        let tmp = TempDir::new().unwrap();
        let store = StreamerStore::at(tmp.path().join("streamers.json"));

        store.update(&strings(&["a", "b", "c"])).await.unwrap();
        let updated = store.update(&strings(&["", "z"])).await.unwrap();
        assert_eq!(updated, slots(["a", "z", "c", "", ""]));
        assert_eq!(store.load().await.unwrap(), updated);

        let on_disk = std::fs::read_to_string(store.path()).unwrap();
        assert!(on_disk.starts_with("{\n    \"streamers\": ["));
    }

    #[tokio::test]
    async fn test_update_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = StreamerStore::at(tmp.path().join("streamers.json"));

        let request = strings(&["a", "", "c", "d", ""]);
        let once = store.update(&request).await.unwrap();
        let twice = store.update(&request).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_corrupt_file_treated_as_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("streamers.json");
        std::fs::write(&path, "{\"streamers\": [\"half").unwrap();

        let store = StreamerStore::at(&path);
        assert_eq!(store.load().await.unwrap(), Streamers::default());

        let updated = store.update(&strings(&["fresh"])).await.unwrap();
        assert_eq!(updated, slots(["fresh", "", "", "", ""]));
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_slots() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(StreamerStore::at(tmp.path().join("streamers.json")));

        let mut handles = Vec::new();
        for i in 0..SLOT_COUNT {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut request = vec![String::new(); SLOT_COUNT];
                request[i] = format!("streamer{}", i);
                store.update(&request).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let final_list = store.load().await.unwrap();
        for (i, slot) in final_list.iter().enumerate() {
            assert_eq!(slot, &format!("streamer{}", i));
        }
    }
}
