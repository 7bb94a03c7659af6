//! Read-only HTTP server for the share directory
//!
//! `GET /` answers a fixed liveness payload. The file route is selected by
//! [`FileRoute`]; every resolved path must stay inside the canonical share root.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::artifacts::SUBSCRIPTION_FILE;
use crate::config::FileRouteKind;
use crate::error::{json_error_response, ArtifactErrorCode};

const LIVENESS_BODY: &str = "Hello world!";

/// Share-mode path answering an HTML index of the share root
const LISTING_PATH: &str = "list";

/// How request paths map onto the share root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRoute {
    /// `GET /{relative path}` serves any file below the root
    Share,
    /// `GET /{token}` serves the subscription file
    Subscription { token: String },
}

impl FileRoute {
    pub fn new(kind: FileRouteKind, sub_path: &str) -> Self {
        match kind {
            FileRouteKind::Share => FileRoute::Share,
            FileRouteKind::Subscription => FileRoute::Subscription {
                token: sub_path.trim_matches('/').to_string(),
            },
        }
    }
}

/// Canonicalized sandbox root
#[derive(Debug, Clone)]
pub struct SharedRoot {
    path: PathBuf,
}

impl SharedRoot {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            path: std::fs::canonicalize(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Decode a raw request path and reject anything that is not a plain
/// relative path.
pub fn validate_request_path(raw: &str) -> Result<String, ArtifactErrorCode> {
    let decoded = urlencoding::decode(raw).map_err(|_| ArtifactErrorCode::BadRequest)?;

    if decoded.is_empty()
        || decoded.contains('\0')
        || decoded.contains('\\')
        || decoded.contains(':')
        || decoded.starts_with('/')
    {
        return Err(ArtifactErrorCode::Forbidden);
    }

    let well_formed = Path::new(decoded.as_ref())
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !well_formed {
        return Err(ArtifactErrorCode::Forbidden);
    }

    Ok(decoded.into_owned())
}

/// Resolve a raw (still percent-encoded) request path below `root`.
///
/// Returns the canonical file path, or the error code the client should see.
pub async fn resolve_request_path(
    root: &SharedRoot,
    raw: &str,
) -> Result<PathBuf, ArtifactErrorCode> {
    let decoded = validate_request_path(raw)?;

    let canonical = match tokio::fs::canonicalize(root.path().join(&decoded)).await {
        Ok(p) => p,
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
            return Err(ArtifactErrorCode::NotFound)
        }
        Err(e) => {
            warn!(path = %decoded, error = %e, "Failed to resolve artifact path");
            return Err(ArtifactErrorCode::ReadFailed);
        }
    };

    // Symlinks may point anywhere
    if !canonical.starts_with(root.path()) {
        return Err(ArtifactErrorCode::Forbidden);
    }

    match tokio::fs::metadata(&canonical).await {
        Ok(m) if m.is_dir() => Err(ArtifactErrorCode::Forbidden),
        Ok(_) => Ok(canonical),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(ArtifactErrorCode::NotFound),
        Err(_) => Err(ArtifactErrorCode::ReadFailed),
    }
}

pub struct ArtifactServer {
    listener: TcpListener,
    route: Arc<FileRoute>,
    root: Arc<SharedRoot>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ArtifactServer {
    /// Bind the listener and pin the share root
    pub async fn bind(
        addr: SocketAddr,
        route: FileRoute,
        share_root: &Path,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let root = SharedRoot::new(share_root).map_err(|e| {
            anyhow::anyhow!("Failed to resolve share root '{}': {}", share_root.display(), e)
        })?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind artifact server on {}: {}", addr, e))?;

        Ok(Self {
            listener,
            route: Arc::new(route),
            root: Arc::new(root),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, root = %self.root.path().display(), "Artifact server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let route = Arc::clone(&self.route);
                            let root = Arc::clone(&self.root);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, route, root).await {
                                    debug!(addr = %peer, error = %e, "Artifact connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Artifact server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(
    stream: S,
    route: Arc<FileRoute>,
    root: Arc<SharedRoot>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let route = Arc::clone(&route);
        let root = Arc::clone(&root);
        async move {
            Ok::<_, hyper::Error>(respond(req.method(), req.uri().path(), &route, &root).await)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Produce the response for one request
pub async fn respond(
    method: &Method,
    path: &str,
    route: &FileRoute,
    root: &SharedRoot,
) -> Response<Full<Bytes>> {
    debug!(%method, path, "Artifact request");

    if *method != Method::GET && *method != Method::HEAD {
        return json_error_response(
            ArtifactErrorCode::MethodNotAllowed,
            format!("method {} not allowed", method),
        );
    }

    if path == "/" {
        return Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Full::new(Bytes::from_static(LIVENESS_BODY.as_bytes())))
            .expect("valid response with StatusCode enum and static header");
    }

    let raw = path.strip_prefix('/').unwrap_or(path);
    match route {
        FileRoute::Share if raw == LISTING_PATH => serve_listing(root).await,
        FileRoute::Share => serve_shared_file(root, raw).await,
        FileRoute::Subscription { token } => match validate_request_path(raw) {
            Ok(requested) if requested == *token => serve_subscription(root).await,
            Ok(_) => json_error_response(ArtifactErrorCode::NotFound, "not found"),
            Err(code) => {
                if code == ArtifactErrorCode::Forbidden {
                    warn!(path = raw, "Rejected subscription path");
                }
                json_error_response(code, format!("cannot serve '{}'", raw))
            }
        },
    }
}

/// `attachment` disposition with an ASCII `filename` and, for other names,
/// an RFC 5987 `filename*`
fn content_disposition(name: &str) -> HeaderValue {
    let fallback: String = name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let value = if fallback == name {
        format!("attachment; filename=\"{}\"", fallback)
    } else {
        format!(
            "attachment; filename=\"{}\"; filename*=UTF-8''{}",
            fallback,
            urlencoding::encode(name)
        )
    };
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

async fn serve_shared_file(root: &SharedRoot, raw: &str) -> Response<Full<Bytes>> {
    let resolved = match resolve_request_path(root, raw).await {
        Ok(p) => p,
        Err(code) => {
            if code == ArtifactErrorCode::Forbidden {
                warn!(path = raw, "Rejected artifact path");
            }
            return json_error_response(code, format!("cannot serve '{}'", raw));
        }
    };

    let bytes = match tokio::fs::read(&resolved).await {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return json_error_response(ArtifactErrorCode::NotFound, format!("no such artifact: {}", raw));
        }
        Err(e) => {
            error!(path = %resolved.display(), error = %e, "Failed to read artifact");
            return json_error_response(ArtifactErrorCode::ReadFailed, "failed to read artifact");
        }
    };

    // Keep the name the client asked for, not the symlink target
    let requested = urlencoding::decode(raw).map(|s| s.into_owned()).unwrap_or_default();
    let name = Path::new(&requested)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let disposition = content_disposition(&name);

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_DISPOSITION, disposition)
        .body(Full::new(Bytes::from(bytes)))
        .expect("valid response with StatusCode enum and checked headers")
}

/// HTML index of the regular files directly under the share root
async fn serve_listing(root: &SharedRoot) -> Response<Full<Bytes>> {
    let mut entries = match tokio::fs::read_dir(root.path()).await {
        Ok(entries) => entries,
        Err(e) => {
            error!(path = %root.path().display(), error = %e, "Failed to list share directory");
            return json_error_response(ArtifactErrorCode::ReadFailed, "failed to list files");
        }
    };

    let mut names = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
                if is_file {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read share directory entry");
                return json_error_response(ArtifactErrorCode::ReadFailed, "failed to list files");
            }
        }
    }
    names.sort();

    let mut html = String::from("<!DOCTYPE html>\n<html><body><ul>\n");
    for name in &names {
        html.push_str(&format!(
            "<li><a href=\"/{}\">{}</a></li>\n",
            urlencoding::encode(name),
            escape_html(name)
        ));
    }
    html.push_str("</ul></body></html>\n");

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(html)))
        .expect("valid response with StatusCode enum and static header")
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

async fn serve_subscription(root: &SharedRoot) -> Response<Full<Bytes>> {
    let path = root.path().join(SUBSCRIPTION_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from(bytes)))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            json_error_response(ArtifactErrorCode::NotFound, "subscription not available")
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read subscription");
            json_error_response(ArtifactErrorCode::ReadFailed, "failed to read subscription")
        }
    }
}
