#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use background_uploader::{DisplayIntent, Notifier, UploadProgress, UploadResult};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// What the multipart endpoint saw for one request.
#[derive(Debug, Clone, Default)]
pub struct ReceivedUpload {
    pub headers: HeaderMap,
    pub fields: Vec<(String, String)>,
    pub file_field: Option<String>,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub file_bytes: Vec<u8>,
}

#[derive(Clone)]
struct AppState {
    status: StatusCode,
    body: &'static str,
    hits: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<ReceivedUpload>>>,
}

pub struct MultipartServer {
    pub url: String,
    pub hits: Arc<AtomicUsize>,
    pub received: Arc<Mutex<Vec<ReceivedUpload>>>,
}

impl MultipartServer {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<ReceivedUpload> {
        self.received.lock().unwrap().clone()
    }
}

async fn handle_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> (StatusCode, &'static str) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let mut upload = ReceivedUpload {
        headers,
        ..ReceivedUpload::default()
    };

    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        if file_name.is_some() {
            upload.file_field = Some(name);
            upload.file_name = file_name;
            upload.content_type = content_type;
            upload.file_bytes = field.bytes().await.unwrap().to_vec();
        } else {
            let value = field.text().await.unwrap();
            upload.fields.push((name, value));
        }
    }

    state.received.lock().unwrap().push(upload);
    (state.status, state.body)
}

/// Multipart endpoint at `/upload` answering every request with `status`.
pub async fn spawn_multipart_server(status: StatusCode, body: &'static str) -> MultipartServer {
    let hits = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(Mutex::new(Vec::new()));
    let state = AppState {
        status,
        body,
        hits: hits.clone(),
        received: received.clone(),
    };

    let app = Router::new()
        .route("/upload", post(handle_upload).put(handle_upload))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MultipartServer {
        url: format!("http://{addr}/upload"),
        hits,
        received,
    }
}

pub struct RawServer {
    pub url: String,
    pub connections: Arc<AtomicUsize>,
}

impl RawServer {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn read_headers(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if find(&buf, b"\r\n\r\n").is_some() {
            return Some(buf);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn read_full_request(stream: &mut TcpStream) -> Option<()> {
    let mut buf = read_headers(stream).await?;
    let header_end = find(&buf, b"\r\n\r\n")? + 4;
    let head = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();

    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok());

    let mut chunk = [0u8; 8192];
    loop {
        let body = &buf[header_end..];
        let done = match content_length {
            Some(len) => body.len() >= len,
            None => body.ends_with(b"0\r\n\r\n"),
        };
        if done {
            return Some(());
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Drops the first `failures` connections after reading the request head,
/// then answers `200 ok` once the whole request has arrived.
pub async fn spawn_flaky_server(failures: usize) -> RawServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if n < failures {
                    let _ = read_headers(&mut stream).await;
                    drop(stream);
                    return;
                }
                if read_full_request(&mut stream).await.is_some() {
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                        )
                        .await;
                    let _ = stream.shutdown().await;
                }
            });
        }
    });

    RawServer {
        url: format!("http://{addr}/upload"),
        connections,
    }
}

/// Answers every request with `500` and a body cut off well short of its
/// declared length.
pub async fn spawn_truncated_error_server() -> RawServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if read_full_request(&mut stream).await.is_some() {
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 100\r\n\r\npartial",
                        )
                        .await;
                    let _ = stream.shutdown().await;
                }
            });
        }
    });

    RawServer {
        url: format!("http://{addr}/upload"),
        connections,
    }
}

/// Reads everything it is sent and never answers.
pub async fn spawn_silent_server() -> RawServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                while let Ok(n) = stream.read(&mut chunk).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });

    RawServer {
        url: format!("http://{addr}/upload"),
        connections,
    }
}

#[derive(Debug, Clone)]
pub enum Recorded {
    Progress(UploadProgress),
    Result(UploadResult),
    Display(DisplayIntent),
}

impl Recorded {
    fn upload_id(&self) -> &str {
        match self {
            Recorded::Progress(p) => &p.upload_id,
            Recorded::Result(r) => &r.upload_id,
            Recorded::Display(d) => d.upload_id(),
        }
    }
}

/// Notifier that keeps every event and forwards results to a channel.
pub struct Recorder {
    events: Mutex<Vec<Recorded>>,
    results: UnboundedSender<UploadResult>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<UploadResult>) {
        let (results, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                results,
            }),
            rx,
        )
    }

    pub fn events_for(&self, upload_id: &str) -> Vec<Recorded> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.upload_id() == upload_id)
            .cloned()
            .collect()
    }

    pub fn progress_for(&self, upload_id: &str) -> Vec<UploadProgress> {
        self.events_for(upload_id)
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Progress(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn results_for(&self, upload_id: &str) -> Vec<UploadResult> {
        self.events_for(upload_id)
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Result(r) => Some(r),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for Recorder {
    async fn on_progress(&self, progress: &UploadProgress) {
        self.events
            .lock()
            .unwrap()
            .push(Recorded::Progress(progress.clone()));
    }

    async fn on_result(&self, result: &UploadResult) {
        self.events
            .lock()
            .unwrap()
            .push(Recorded::Result(result.clone()));
        let _ = self.results.send(result.clone());
    }

    async fn on_display(&self, intent: &DisplayIntent) {
        self.events
            .lock()
            .unwrap()
            .push(Recorded::Display(intent.clone()));
    }
}

/// Waits for the result of `upload_id`, skipping results for other ids.
pub async fn wait_for_result(
    rx: &mut UnboundedReceiver<UploadResult>,
    upload_id: &str,
) -> UploadResult {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let result = rx.recv().await.expect("result channel closed");
            if result.upload_id == upload_id {
                return result;
            }
        }
    })
    .await
    .expect("timed out waiting for upload result")
}

pub fn fixture(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("upload-")
        .suffix(".bin")
        .tempfile()
        .unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect()
}
