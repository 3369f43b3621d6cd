//! Object delivery: cache lookup, origin fetch, range-aware streaming,
//! playlist rewriting and the tee that fills the cache behind a
//! streaming response.

use axum::body::Body;
use axum::extract::{OriginalUri, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt, stream};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, warn};
use url::Url;

use super::{AppState, mime, parse_object_path};
use crate::cache::item::{CacheItem, SetOptions, cache_key};
use crate::error::ProxyError;
use crate::origin::{ObjectMetadata, OriginError};
use crate::playlist;

/// Largest object the streaming tee will admit to the cache.
const STREAM_CACHE_MAX: u64 = 5 * 1024 * 1024;
/// Rewritten playlists above this are served but not cached.
const PLAYLIST_CACHE_MAX: usize = 1024 * 1024;
const CACHE_CONTROL: &str = "public, max-age=3600";

fn map_origin(err: OriginError) -> ProxyError {
    match err {
        OriginError::NoSuchKey(m) => ProxyError::NotFound(format!("no such object: {m}")),
        OriginError::NoSuchBucket(m) => ProxyError::NotFound(format!("no such bucket: {m}")),
        OriginError::AccessDenied(m) => ProxyError::Forbidden(format!("access denied: {m}")),
        OriginError::Other(m) => ProxyError::Origin(m),
    }
}

fn http_date(dt: &DateTime<Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// The URL this request was served under, used as the base for playlist
/// rewriting. TLS termination is out of scope, so the scheme is plain
/// HTTP.
fn request_url(headers: &HeaderMap, uri: &axum::http::Uri) -> Result<Url, ProxyError> {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Url::parse(&format!("http://{host}{path}"))
        .map_err(|e| ProxyError::Internal(format!("request URL: {e}")))
}

struct ResponseMeta<'a> {
    status: StatusCode,
    content_type: &'a str,
    content_length: Option<u64>,
    content_range: Option<&'a str>,
    etag: Option<&'a str>,
    last_modified: Option<DateTime<Utc>>,
    x_cache: &'a str,
}

fn build_response(meta: ResponseMeta<'_>, body: Body) -> Result<Response, ProxyError> {
    let mut builder = Response::builder()
        .status(meta.status)
        .header(header::CONTENT_TYPE, meta.content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, CACHE_CONTROL)
        .header("X-Cache", meta.x_cache);
    if let Some(len) = meta.content_length {
        builder = builder.header(header::CONTENT_LENGTH, len);
    }
    if let Some(range) = meta.content_range {
        builder = builder.header(header::CONTENT_RANGE, range);
    }
    if let Some(etag) = meta.etag {
        builder = builder.header(header::ETAG, etag);
    }
    if let Some(lm) = meta.last_modified {
        builder = builder.header(header::LAST_MODIFIED, http_date(&lm));
    }
    builder
        .body(body)
        .map_err(|e| ProxyError::Internal(format!("response build: {e}")))
}

fn cached_response(item: &CacheItem) -> Result<Response, ProxyError> {
    build_response(
        ResponseMeta {
            status: StatusCode::OK,
            content_type: item.content_type.as_deref().unwrap_or(mime::OCTET_STREAM),
            content_length: Some(item.size),
            content_range: None,
            etag: item.etag.as_deref(),
            last_modified: item.last_modified,
            x_cache: "HIT",
        },
        Body::from(item.data.clone()),
    )
}

/// Streams the origin body through to the client while copying bytes into
/// a bounded buffer. The completion callback fires only when the origin
/// stream ends normally, so a client disconnect or transport error never
/// seeds the cache with a partial object.
struct TeeStream<S> {
    inner: S,
    buffer: Option<Vec<u8>>,
    cap: usize,
    on_complete: Option<Box<dyn FnOnce(Vec<u8>) + Send>>,
}

impl<S> TeeStream<S> {
    fn new(inner: S, cap: usize, on_complete: Box<dyn FnOnce(Vec<u8>) + Send>) -> Self {
        Self {
            inner,
            buffer: Some(Vec::new()),
            cap,
            on_complete: Some(on_complete),
        }
    }
}

impl<S> Stream for TeeStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(buffer) = this.buffer.as_mut() {
                    if buffer.len() + chunk.len() > this.cap {
                        // The advertised length undershot; stop buffering
                        // and keep streaming uncached.
                        this.buffer = None;
                    } else {
                        buffer.extend_from_slice(&chunk);
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.buffer = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let (Some(buffer), Some(callback)) =
                    (this.buffer.take(), this.on_complete.take())
                {
                    callback(buffer);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

pub async fn get_object(
    State(state): State<AppState>,
    Path(path): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    let (bucket, key) = parse_object_path(&path, &state.config.origin.default_bucket)?;
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let ck = cache_key(&bucket, &key, range.as_deref());

    if range.is_none() {
        if let Some(item) = state.cache.get(&ck).await {
            debug!(key = %ck, "cache hit");
            return cached_response(&item);
        }
    }

    let fetched = state
        .origin
        .get_object(&bucket, &key, range.as_deref())
        .await
        .map_err(map_origin)?;
    let meta = fetched.metadata.clone();

    if playlist::is_playlist(meta.content_type.as_deref(), &key) {
        return serve_playlist(&state, &ck, &key, range.as_deref(), fetched.body, &meta, &headers, &uri)
            .await;
    }

    serve_stream(&state, ck, key, range, fetched.body, meta).await
}

/// Buffer, rewrite and serve an HLS playlist, caching the rewritten bytes
/// when they are small enough.
#[allow(clippy::too_many_arguments)]
async fn serve_playlist(
    state: &AppState,
    ck: &str,
    key: &str,
    range: Option<&str>,
    mut body: crate::origin::BodyStream,
    meta: &ObjectMetadata,
    headers: &HeaderMap,
    uri: &axum::http::Uri,
) -> Result<Response, ProxyError> {
    let mut raw = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| ProxyError::Origin(format!("origin stream: {e}")))?;
        raw.extend_from_slice(&chunk);
    }

    let playlist_url = request_url(headers, uri)?;
    let rewritten = playlist::rewrite_playlist(&raw, &playlist_url, &state.config.server.cdn_base_path)
        .map_err(|e| ProxyError::Rewrite(e.to_string()))?;
    let bytes = Bytes::from(rewritten);

    let content_type = match meta.content_type.as_deref() {
        Some(ct) if playlist::HLS_MIME_TYPES.iter().any(|m| ct.eq_ignore_ascii_case(m)) => {
            ct.to_string()
        }
        _ => playlist::HLS_MIME_TYPES[0].to_string(),
    };

    if range.is_none() && bytes.len() < PLAYLIST_CACHE_MAX {
        let opts = SetOptions {
            ttl: None,
            content_type: Some(content_type.clone()),
            etag: meta.etag.clone(),
            last_modified: meta.last_modified,
        };
        if !state.cache.set(ck, bytes.clone(), opts).await {
            debug!(key = %ck, "rewritten playlist not admitted to cache");
        }
    }

    build_response(
        ResponseMeta {
            status: StatusCode::OK,
            content_type: &content_type,
            content_length: Some(bytes.len() as u64),
            content_range: None,
            etag: meta.etag.as_deref(),
            last_modified: meta.last_modified,
            x_cache: "MISS",
        },
        Body::from(bytes),
    )
}

/// Stream a non-playlist body to the client, teeing into the cache when
/// the object is small enough and the request carried no range.
async fn serve_stream(
    state: &AppState,
    ck: String,
    key: String,
    range: Option<String>,
    mut body: crate::origin::BodyStream,
    meta: ObjectMetadata,
) -> Result<Response, ProxyError> {
    // Peek the first chunk so a signature sniff can upgrade a generic
    // content type before headers go out.
    let first = match body.next().await {
        Some(Ok(chunk)) => Some(chunk),
        Some(Err(e)) => return Err(ProxyError::Origin(format!("origin stream: {e}"))),
        None => None,
    };
    let content_type = mime::resolve(
        meta.content_type.as_deref(),
        &key,
        first.as_deref(),
    );

    let status = if meta.content_range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let chained = stream::iter(first.into_iter().map(Ok)).chain(body);

    let cacheable = range.is_none()
        && meta
            .content_length
            .is_some_and(|len| len <= STREAM_CACHE_MAX);

    let response_body = if cacheable {
        let cache = state.cache.clone();
        let opts = SetOptions {
            ttl: None,
            content_type: Some(content_type.clone()),
            etag: meta.etag.clone(),
            last_modified: meta.last_modified,
        };
        let fill_key = ck.clone();
        let on_complete = Box::new(move |buffer: Vec<u8>| {
            tokio::spawn(async move {
                if cache.set(&fill_key, Bytes::from(buffer), opts).await {
                    debug!(key = %fill_key, "cache filled after stream");
                } else {
                    warn!(key = %fill_key, "cache fill refused after stream");
                }
            });
        });
        Body::from_stream(TeeStream::new(chained, STREAM_CACHE_MAX as usize, on_complete))
    } else {
        Body::from_stream(chained)
    };

    build_response(
        ResponseMeta {
            status,
            content_type: &content_type,
            content_length: meta.content_length,
            content_range: meta.content_range.as_deref(),
            etag: meta.etag.as_deref(),
            last_modified: meta.last_modified,
            x_cache: "MISS",
        },
        response_body,
    )
}

/// HEAD mirrors GET's headers through `HeadObject` and never reads a
/// body or touches the cache.
pub async fn head_object(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ProxyError> {
    let (bucket, key) = parse_object_path(&path, &state.config.origin.default_bucket)?;
    let meta = state
        .origin
        .head_object(&bucket, &key)
        .await
        .map_err(map_origin)?;

    let content_type = mime::resolve(meta.content_type.as_deref(), &key, None);
    build_response(
        ResponseMeta {
            status: StatusCode::OK,
            content_type: &content_type,
            content_length: meta.content_length,
            content_range: None,
            etag: meta.etag.as_deref(),
            last_modified: meta.last_modified,
            x_cache: "MISS",
        },
        Body::empty(),
    )
}
