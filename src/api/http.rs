//! HTTP implementation of [`CloudApi`].
//!
//! Every request runs on its own tokio task and reports back through an
//! unbounded channel. Redirects are never followed by the client; they are
//! surfaced as [`ApiEvent::Redirected`] so the transfer queue can schedule the
//! follow-up request itself.

use std::collections::HashMap;
use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures::{Stream, StreamExt};
use reqwest::{header, multipart, redirect, Client, RequestBuilder, Response};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;
use tokio_util::io::ReaderStream;

use super::{ApiError, ApiEvent, CloudApi, RemoteFile, RequestId};
use crate::config::Config;

/// How a download request ended, when it did not fail.
enum DownloadOutcome {
    Completed,
    Redirected,
}

pub struct HttpCloudApi {
    client: Client,
    base_url: String,
    token: Option<String>,
    events: UnboundedSender<ApiEvent>,
    next_id: u64,
    tasks: HashMap<RequestId, AbortHandle>,
}

impl HttpCloudApi {
    /// Create a client for the store configured in `config`.
    ///
    /// Requests are spawned on the current tokio runtime, so the `start_*`
    /// methods must be called from within one.
    pub fn new(config: &Config, events: UnboundedSender<ApiEvent>) -> Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .user_agent(config.user_agent.as_str())
            .build()
            .context("Failed to build HTTP client")?;

        let mut base_url = config.base_url.clone();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
            events,
            next_id: 0,
            tasks: HashMap::new(),
        })
    }

    /// Fetch the remote file listing of a project without going through the
    /// event channel.
    pub async fn fetch_file_list(&self, project_id: &str) -> std::result::Result<Vec<RemoteFile>, ApiError> {
        let builder = self.authorized(self.client.get(self.url(&format!("files/{}/", project_id))));
        fetch_listing(builder).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.header(header::AUTHORIZATION, format!("Token {}", token)),
            None => builder,
        }
    }

    fn next_request(&mut self) -> RequestId {
        self.next_id += 1;
        RequestId(self.next_id)
    }

    fn spawn<F>(&mut self, request: RequestId, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|_, handle| !handle.is_finished());
        let handle = tokio::spawn(task);
        self.tasks.insert(request, handle.abort_handle());
    }

    fn spawn_download(&mut self, request: RequestId, builder: RequestBuilder, destination: &Path) {
        let events = self.events.clone();
        let destination = destination.to_path_buf();

        self.spawn(request, async move {
            match download(builder, &destination, request, &events).await {
                Ok(DownloadOutcome::Redirected) => {}
                Ok(DownloadOutcome::Completed) => {
                    let _ = events.send(ApiEvent::Finished { request, result: Ok(()) });
                }
                Err(err) => {
                    let _ = events.send(ApiEvent::Finished { request, result: Err(err) });
                }
            }
        });
    }
}

impl CloudApi for HttpCloudApi {
    fn start_upload(&mut self, key: &str, local_file: &Path) -> RequestId {
        let request = self.next_request();
        let builder = self.authorized(self.client.post(self.url(&format!("files/{}", key))));
        let events = self.events.clone();
        let local_file = local_file.to_path_buf();

        tracing::debug!("Upload {} started for {}", request, key);
        self.spawn(request, async move {
            let result = upload(builder, &local_file, request, &events).await;
            let _ = events.send(ApiEvent::Finished { request, result });
        });

        request
    }

    fn start_download(&mut self, key: &str, version_id: Option<&str>, destination: &Path) -> RequestId {
        let request = self.next_request();
        let mut builder = self.authorized(self.client.get(self.url(&format!("files/{}/", key))));
        if let Some(version) = version_id {
            builder = builder.query(&[("version", version)]);
        }

        tracing::debug!("Download {} started for {}", request, key);
        self.spawn_download(request, builder, destination);
        request
    }

    fn follow_redirect(&mut self, url: &str, destination: &Path) -> RequestId {
        let request = self.next_request();
        // Redirect targets are pre-signed; they must not carry our token.
        let builder = self.client.get(url);

        tracing::debug!("Download {} following redirect", request);
        self.spawn_download(request, builder, destination);
        request
    }

    fn start_delete(&mut self, key: &str) -> RequestId {
        let request = self.next_request();
        let builder = self.authorized(self.client.delete(self.url(&format!("files/{}/", key))));
        let events = self.events.clone();

        tracing::debug!("Delete {} started for {}", request, key);
        self.spawn(request, async move {
            let result = match builder.send().await {
                Ok(response) => classify(response).await,
                Err(err) => Err(transport_error(err)),
            };
            let _ = events.send(ApiEvent::Finished { request, result });
        });

        request
    }

    fn refresh_file_list(&mut self, project_id: &str) -> RequestId {
        let request = self.next_request();
        let builder = self.authorized(self.client.get(self.url(&format!("files/{}/", project_id))));
        let events = self.events.clone();

        self.spawn(request, async move {
            let result = match fetch_listing(builder).await {
                Ok(files) => {
                    let _ = events.send(ApiEvent::FileList { request, files });
                    Ok(())
                }
                Err(err) => Err(err),
            };
            let _ = events.send(ApiEvent::Finished { request, result });
        });

        request
    }

    fn abort(&mut self, request: RequestId) {
        if let Some(handle) = self.tasks.remove(&request) {
            tracing::debug!("Aborting request {}", request);
            handle.abort();
        }
    }
}

fn transport_error(err: reqwest::Error) -> ApiError {
    ApiError::Transport(err.to_string())
}

async fn classify(response: Response) -> std::result::Result<(), ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let detail = response.text().await.unwrap_or_default();
    Err(ApiError::Http {
        status: status.as_u16(),
        detail,
    })
}

async fn fetch_listing(builder: RequestBuilder) -> std::result::Result<Vec<RemoteFile>, ApiError> {
    let response = builder.send().await.map_err(transport_error)?;
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(ApiError::Http {
            status: status.as_u16(),
            detail,
        });
    }

    response
        .json::<Vec<RemoteFile>>()
        .await
        .map_err(|e| ApiError::InvalidResponse(e.to_string()))
}

async fn upload(
    builder: RequestBuilder,
    local_file: &Path,
    request: RequestId,
    events: &UnboundedSender<ApiEvent>,
) -> std::result::Result<(), ApiError> {
    let file = tokio::fs::File::open(local_file)
        .await
        .map_err(|e| ApiError::Transport(format!("Failed to open {}: {}", local_file.display(), e)))?;
    let total = file.metadata().await.map(|m| m.len()).unwrap_or(0);
    let file_name = local_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let progress = events.clone();
    let mut sent = 0u64;
    let stream = ReaderStream::new(file).map(move |chunk| {
        if let Ok(bytes) = &chunk {
            sent += bytes.len() as u64;
            let _ = progress.send(ApiEvent::UploadProgress { request, sent, total });
        }
        chunk
    });

    let part = multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), total)
        .file_name(file_name);
    let form = multipart::Form::new().part("file", part);

    let response = builder.multipart(form).send().await.map_err(transport_error)?;
    classify(response).await
}

async fn download(
    builder: RequestBuilder,
    destination: &Path,
    request: RequestId,
    events: &UnboundedSender<ApiEvent>,
) -> std::result::Result<DownloadOutcome, ApiError> {
    let response = builder.send().await.map_err(transport_error)?;
    let status = response.status();

    if status.is_redirection() {
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::InvalidResponse(format!("redirect {} without location", status)))?;
        let url = response
            .url()
            .join(location)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| location.to_string());

        // The body of a redirect is never consumed.
        let _ = events.send(ApiEvent::Redirected { request, url });
        return Ok(DownloadOutcome::Redirected);
    }

    if !status.is_success() {
        return classify(response).await.map(|()| DownloadOutcome::Completed);
    }

    let total = response.content_length().unwrap_or(0);
    let mut received = 0u64;
    save_stream(response.bytes_stream(), destination, |chunk| {
        received += chunk;
        let _ = events.send(ApiEvent::DownloadProgress {
            request,
            received,
            total: total.max(received),
        });
    })
    .await?;

    Ok(DownloadOutcome::Completed)
}

/// Sibling of `destination` that receives the body while it streams in.
fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.file_name().map(OsString::from).unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// Stream `body` into a partial file next to `destination` and move it into
/// place once the whole body arrived. On failure the partial file is removed
/// and `destination` is left untouched.
async fn save_stream<S, B, E>(
    body: S,
    destination: &Path,
    mut on_chunk: impl FnMut(u64),
) -> std::result::Result<(), ApiError>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ApiError::Transport(format!("Failed to create directory {}: {}", parent.display(), e)))?;
    }

    let partial = partial_path(destination);
    let result = write_partial(body, &partial, &mut on_chunk).await;
    let result = match result {
        Ok(()) => tokio::fs::rename(&partial, destination)
            .await
            .map_err(|e| ApiError::Transport(format!("Failed to move download to {}: {}", destination.display(), e))),
        Err(err) => Err(err),
    };

    if result.is_err() {
        let _ = tokio::fs::remove_file(&partial).await;
    }
    result
}

async fn write_partial<S, B, E>(
    body: S,
    partial: &Path,
    on_chunk: &mut impl FnMut(u64),
) -> std::result::Result<(), ApiError>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut file = tokio::fs::File::create(partial)
        .await
        .map_err(|e| ApiError::Transport(format!("Failed to create {}: {}", partial.display(), e)))?;

    let mut body = std::pin::pin!(body);
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| ApiError::Transport(e.to_string()))?;
        let bytes = chunk.as_ref();
        file.write_all(bytes)
            .await
            .map_err(|e| ApiError::Transport(format!("Failed to write {}: {}", partial.display(), e)))?;
        on_chunk(bytes.len() as u64);
    }

    file.flush()
        .await
        .map_err(|e| ApiError::Transport(format!("Failed to flush {}: {}", partial.display(), e)))
}
