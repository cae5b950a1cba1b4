use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::request::UploadRequest;
use crate::upload::progress::ProgressStream;
use log::{debug, info, warn};
use reqwest::Client as HttpClient;
use reqwest::multipart::{Form, Part};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;

const CHUNK_SIZE: usize = 64 * 1024;
const FILE_CONTENT_TYPE: &str = "application/octet-stream";

/// Response captured from a successful (2xx) upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub status_code: u16,
    pub response: String,
}

/// Performs one multipart/form-data request per call.
///
/// The file part is streamed from disk. Dropping the future returned by
/// [`Executor::execute`] aborts the request and closes the connection.
#[derive(Clone)]
pub struct Executor {
    http: HttpClient,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Executor {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &ManagerConfig) -> Result<Self> {
        let mut builder = HttpClient::builder().connect_timeout(config.connect_timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            http: builder.build()?,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        })
    }

    /// Size of the file to upload.
    ///
    /// # Errors
    ///
    /// Returns `FileNotFound` if the path does not exist, cannot be inspected
    /// or is not a regular file.
    pub async fn probe_file(path: &Path) -> Result<u64> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => Ok(metadata.len()),
            Ok(_) => Err(Error::FileNotFound(format!(
                "{} is not a regular file",
                path.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::FileNotFound(path.display().to_string()))
            }
            Err(e) => Err(Error::FileNotFound(format!("{} ({e})", path.display()))),
        }
    }

    /// Uploads `request.file_path` as the last part of a multipart form.
    ///
    /// `on_progress` receives the cumulative number of file bytes handed to
    /// the transport. It is called with strictly increasing values and
    /// reaches `total_bytes` once the whole file has been sent.
    ///
    /// # Errors
    ///
    /// - `FileNotFound` if the file disappeared or cannot be opened
    /// - `RetryableError` for connection failures, resets and timeouts that
    ///   happen before a response arrives
    /// - `HttpError` for a non-2xx response, carrying the body when it could be read
    /// - `InternalError` if the body of a 2xx response cannot be read
    pub async fn execute<F>(
        &self,
        request: &UploadRequest,
        total_bytes: u64,
        mut on_progress: F,
    ) -> Result<UploadOutcome>
    where
        F: FnMut(u64) + Send + Sync + Unpin + 'static,
    {
        let filename = request.file_name()?.to_string();
        let method = request.http_method()?;
        let url = request.parsed_url()?;
        let headers = request.header_map()?;

        let file = match tokio::fs::File::open(&request.file_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(request.file_path.display().to_string()));
            }
            Err(e) => {
                return Err(Error::FileNotFound(format!(
                    "{} ({e})",
                    request.file_path.display()
                )));
            }
        };

        let activity = Arc::new(BodyActivity::new());
        let activity_clone = activity.clone();
        let body = ProgressStream::new(
            ReaderStream::with_capacity(file, CHUNK_SIZE),
            move |sent| {
                activity_clone.record(sent);
                on_progress(sent);
            },
        );

        let file_part = Part::stream_with_length(reqwest::Body::wrap_stream(body), total_bytes)
            .file_name(filename)
            .mime_str(FILE_CONTENT_TYPE)
            .map_err(|e| Error::InternalError(format!("Invalid content type: {e}")))?;

        let mut form = Form::new();
        for (name, value) in &request.fields {
            form = form.text(name.clone(), value.clone());
        }
        form = form.part(request.file_field_name.clone(), file_part);

        debug!(
            "Sending {} {} for upload {} ({} bytes, {} fields)",
            method,
            url,
            request.upload_id,
            total_bytes,
            request.fields.len()
        );

        let send = self
            .http
            .request(method, url)
            .headers(headers)
            .multipart(form)
            .send();

        let response = tokio::select! {
            res = send => res.map_err(classify_send_error)?,
            err = watch_stall(&activity, total_bytes, self.write_timeout, self.read_timeout) => {
                return Err(err);
            }
        };

        let status = response.status();
        info!(
            "Upload {} received response with status: {status}",
            request.upload_id
        );

        let body = match tokio::time::timeout(self.read_timeout, response.text()).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(e)) => Err(format!("Failed to read response body: {}", error_chain(&e))),
            Err(_) => Err(format!(
                "Timed out reading response body after {}ms",
                self.read_timeout.as_millis()
            )),
        };

        if status.is_success() {
            let body = body.map_err(Error::InternalError)?;
            debug!("Response body: {body}");
            return Ok(UploadOutcome {
                status_code: status.as_u16(),
                response: body,
            });
        }

        // The status alone is definitive; a broken body only loses the text
        let response = match body {
            Ok(body) => {
                debug!("Response body: {body}");
                Some(body)
            }
            Err(reason) => {
                warn!("Upload {}: {reason}", request.upload_id);
                None
            }
        };
        Err(Error::HttpError {
            status: status.as_u16(),
            message: status
                .canonical_reason()
                .unwrap_or("Unknown status")
                .to_string(),
            response,
        })
    }
}

/// Tracks when the request body last handed bytes to the transport.
struct BodyActivity {
    started: Instant,
    last_write_ms: AtomicU64,
    bytes_sent: AtomicU64,
}

/// `last_write_ms` before the first chunk has been sent.
const NOT_STARTED: u64 = u64::MAX;

impl BodyActivity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_write_ms: AtomicU64::new(NOT_STARTED),
            bytes_sent: AtomicU64::new(0),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(NOT_STARTED - 1)
    }

    fn record(&self, sent: u64) {
        self.bytes_sent.store(sent, Ordering::Release);
        self.last_write_ms.store(self.elapsed_ms(), Ordering::Release);
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Acquire)
    }

    /// Time since the last chunk was sent, or `None` if none has been yet.
    fn idle(&self) -> Option<Duration> {
        let last = self.last_write_ms.load(Ordering::Acquire);
        if last == NOT_STARTED {
            return None;
        }
        Some(Duration::from_millis(self.elapsed_ms().saturating_sub(last)))
    }

    fn since_start(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Resolves once the request has gone quiet for too long: the body stalled
/// before `total_bytes` were sent, or the response did not arrive after the
/// body finished.
///
/// The stall clock starts with the first chunk, so connection setup is
/// bounded by the client's connect timeout alone. An empty file never sends
/// a chunk and waits for its response from the start of the attempt.
async fn watch_stall(
    activity: &BodyActivity,
    total_bytes: u64,
    write_timeout: Duration,
    read_timeout: Duration,
) -> Error {
    let tick = (write_timeout.min(read_timeout) / 4).max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(tick).await;
        let idle = match activity.idle() {
            Some(idle) => idle,
            None if total_bytes == 0 => activity.since_start(),
            None => continue,
        };
        if activity.bytes_sent() < total_bytes {
            if idle >= write_timeout {
                return Error::RetryableError(format!(
                    "Request body stalled for {}ms",
                    idle.as_millis()
                ));
            }
        } else if idle >= read_timeout {
            return Error::RetryableError(format!(
                "Timed out waiting for response after {}ms",
                idle.as_millis()
            ));
        }
    }
}

fn classify_send_error(e: reqwest::Error) -> Error {
    if e.is_builder() {
        return Error::InternalError(error_chain(&e));
    }
    if e.is_timeout() {
        return Error::RetryableError(format!("Request timed out: {}", error_chain(&e)));
    }
    Error::RetryableError(error_chain(&e))
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
