use std::{
    convert::Infallible,
    fs::Metadata,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::{future::BoxFuture, TryStreamExt as _};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt as _, Empty, Full, StreamBody};
use hyper::{
    body::Frame,
    header::{
        HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, IF_MODIFIED_SINCE, IF_NONE_MATCH,
        LAST_MODIFIED, LOCATION, SERVER,
    },
    http::request::Parts,
    service::Service,
    Method, Request, Response, StatusCode,
};

use tokio_util::io::ReaderStream;

use crate::{content_type, listing};

/// File contents are streamed from disk, everything else is built in memory.
pub type Body = UnsyncBoxBody<Bytes, io::Error>;

const SERVER_NAME: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const INDEX_FILES: [&str; 2] = ["index.html", "index.htm"];
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";
const RFC850_DATE: &str = "%A, %d-%b-%y %H:%M:%S GMT";
const ASCTIME_DATE: &str = "%a %b %e %H:%M:%S %Y";

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("request path is not valid percent-encoded UTF-8")]
    Undecodable,
    #[error("request path escapes the served directory")]
    OutsideRoot,
}

/// Maps a request path onto a file below `root`.
///
/// Empty and `.` segments are skipped, anything that could climb out of `root`
/// is refused.
pub fn map_path(root: &Path, request_path: &str) -> Result<PathBuf, PathError> {
    let decoded = urlencoding::decode(request_path).map_err(|_| PathError::Undecodable)?;
    let mut path = root.to_path_buf();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathError::OutsideRoot),
            s if s.contains(|c: char| c == '\\' || c == '\0') => {
                return Err(PathError::OutsideRoot)
            }
            s => path.push(s),
        }
    }
    Ok(path)
}

/// Serves GET and HEAD requests from a directory tree.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: Arc<PathBuf>,
}

impl StaticFiles {
    pub fn new(root: PathBuf) -> Self {
        StaticFiles {
            root: Arc::new(root),
        }
    }
}

impl<B> Service<Request<B>> for StaticFiles {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let root = self.root.clone();
        let (parts, _body) = req.into_parts();
        Box::pin(async move {
            let head_only = parts.method == Method::HEAD;
            let mut response = respond(&root, &parts).await;
            if head_only {
                *response.body_mut() = empty();
            }
            Ok(response)
        })
    }
}

async fn respond(root: &Path, parts: &Parts) -> Response<Body> {
    if parts.method != Method::GET && parts.method != Method::HEAD {
        return error(
            StatusCode::NOT_IMPLEMENTED,
            &format!("Unsupported method ({})", parts.method),
        );
    }

    let request_path = parts.uri.path();
    let path = match map_path(root, request_path) {
        Ok(path) => path,
        Err(PathError::Undecodable) => return error(StatusCode::BAD_REQUEST, "Bad request path"),
        Err(err @ PathError::OutsideRoot) => {
            tracing::warn!(path = request_path, %err, "Refused request path");
            return error(StatusCode::NOT_FOUND, "File not found");
        }
    };

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata,
        Err(err) => {
            tracing::debug!(path = %path.display(), %err, "No such file");
            return error(StatusCode::NOT_FOUND, "File not found");
        }
    };

    if !metadata.is_dir() {
        if request_path.ends_with('/') {
            return error(StatusCode::NOT_FOUND, "File not found");
        }
        return serve_file(&path, &metadata, &parts.headers).await;
    }

    if !request_path.ends_with('/') {
        return redirect_to_directory(parts);
    }

    for index in INDEX_FILES {
        let index_path = path.join(index);
        if let Ok(metadata) = tokio::fs::metadata(&index_path).await {
            if metadata.is_file() {
                return serve_file(&index_path, &metadata, &parts.headers).await;
            }
        }
    }

    match listing::read_entries(&path).await {
        Ok(entries) => {
            let decoded = urlencoding::decode(request_path).unwrap_or_default();
            let html = listing::render(&decoded, &entries);
            with_body(StatusCode::OK, content_type::HTML, Bytes::from(html))
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "Could not list directory");
            error(StatusCode::NOT_FOUND, "No permission to list directory")
        }
    }
}

async fn serve_file(path: &Path, metadata: &Metadata, headers: &HeaderMap) -> Response<Body> {
    let last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);

    if let Some(modified) = last_modified {
        if !headers.contains_key(IF_NONE_MATCH) && not_modified_since(headers, modified) {
            return bare(StatusCode::NOT_MODIFIED);
        }
    }

    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return error(StatusCode::NOT_FOUND, "File not found")
        }
        Err(err) => {
            tracing::error!(path = %path.display(), %err, "Failed to open file");
            return error(StatusCode::INTERNAL_SERVER_ERROR, "Could not read file");
        }
    };

    let mut response = bare(StatusCode::OK);
    let response_headers = response.headers_mut();
    response_headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type::for_path(path)),
    );
    response_headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    let frames = ReaderStream::new(file).map_ok(Frame::data);
    *response.body_mut() = StreamBody::new(frames).boxed_unsync();
    if let Some(value) = last_modified.and_then(|m| HeaderValue::from_str(&http_date(m)).ok()) {
        response.headers_mut().insert(LAST_MODIFIED, value);
    }
    response
}

fn not_modified_since(headers: &HeaderMap, modified: DateTime<Utc>) -> bool {
    let Some(since) = headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_http_date)
    else {
        return false;
    };
    modified.timestamp() <= since.timestamp()
}

fn redirect_to_directory(parts: &Parts) -> Response<Body> {
    let mut location = format!("{}/", parts.uri.path());
    if let Some(query) = parts.uri.query() {
        location.push('?');
        location.push_str(query);
    }
    let Ok(location) = HeaderValue::from_str(&location) else {
        return error(StatusCode::BAD_REQUEST, "Bad request path");
    };
    let mut response = bare(StatusCode::MOVED_PERMANENTLY);
    response.headers_mut().insert(LOCATION, location);
    response.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(0u64));
    response
}

pub fn http_date(time: DateTime<Utc>) -> String {
    time.format(HTTP_DATE).to_string()
}

/// Accepts the three date formats HTTP/1.1 allows: IMF-fixdate, RFC 850 and asctime.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    [HTTP_DATE, RFC850_DATE, ASCTIME_DATE]
        .into_iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

fn empty() -> Body {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

fn full(bytes: Bytes) -> Body {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

fn bare(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(SERVER, HeaderValue::from_static(SERVER_NAME));
    response
}

fn with_body(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Body> {
    let mut response = bare(status);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
    *response.body_mut() = full(body);
    response
}

fn error(status: StatusCode, message: &str) -> Response<Body> {
    let code = status.as_u16();
    let reason = status.canonical_reason().unwrap_or("Error");
    let html = format!(
        "<!DOCTYPE HTML>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>Error response</title>\n</head>\n<body>\n<h1>Error response</h1>\n\
         <p>Error code: {code}</p>\n<p>Message: {}.</p>\n<p>{code} - {reason}</p>\n\
         </body>\n</html>\n",
        listing::escape(message),
    );
    with_body(status, content_type::HTML, Bytes::from(html))
}
