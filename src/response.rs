//! Outgoing response state.
//!
//! Handlers never build a response value themselves. They mutate the
//! per-request [`ResponseState`] through [`Context`](crate::Context), and the
//! dispatcher turns it into a hyper response once the middleware chain
//! returns. Body writers are terminal: the first one wins, and status or
//! header changes after it are ignored.

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use sha2::{Digest, Sha256};
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::request::Request;

/// Body type of every response flow produces.
pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Content-type values the body writers set.
#[derive(Clone, Copy, Debug)]
pub enum ContentType {
    Html,         // text/html; charset=utf-8
    Json,         // application/json; charset=utf-8
    OctetStream,  // application/octet-stream  (file download)
    Text,         // text/plain; charset=utf-8
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json; charset=utf-8",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
        }
    }
}

// ── ResponseState ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) enum Payload {
    #[default]
    Empty,
    Bytes(Bytes),
    File(tokio::fs::File),
}

/// Mutable, write-once view of the response being built for one request.
#[derive(Debug)]
pub(crate) struct ResponseState {
    status: u16,
    headers: HeaderMap,
    payload: Payload,
    written: bool,
}

impl ResponseState {
    pub(crate) fn new() -> Self {
        Self { status: 200, headers: HeaderMap::new(), payload: Payload::Empty, written: false }
    }

    /// 200 until something sets it.
    pub(crate) fn status(&self) -> u16 { self.status }
    pub(crate) fn headers(&self) -> &HeaderMap { &self.headers }
    pub(crate) fn is_written(&self) -> bool { self.written }

    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Replaces any previous value. Invalid names or values are dropped.
    pub(crate) fn set_header(&mut self, name: &str, value: &str) {
        if self.written {
            warn!(header = name, "header set after the body was written, ignored");
            return;
        }
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => warn!(header = name, "invalid header, ignored"),
        }
    }

    pub(crate) fn set_status(&mut self, code: u16) {
        if self.written {
            warn!(status = code, "status set after the body was written, ignored");
            return;
        }
        if StatusCode::from_u16(code).is_err() {
            warn!(status = code, "invalid status code, ignored");
            return;
        }
        self.status = code;
    }

    pub(crate) fn set_length(&mut self, length: u64) {
        self.set_header(CONTENT_LENGTH.as_str(), &length.to_string());
    }

    /// Claims the single terminal write. False if another writer got there first.
    fn begin_write(&mut self, writer: &str) -> bool {
        if self.written {
            warn!(writer, "response already written, ignored");
            return false;
        }
        true
    }

    fn commit(&mut self, payload: Payload) {
        self.payload = payload;
        self.written = true;
    }

    /// Sets `Location` and the status; no body.
    pub(crate) fn redirect(&mut self, url: &str, code: u16) {
        if !self.begin_write("redirect") {
            return;
        }
        self.set_header(http::header::LOCATION.as_str(), url);
        self.set_status(code);
        self.commit(Payload::Empty);
    }

    /// Streams an already opened file of `length` bytes.
    pub(crate) fn file(&mut self, file: tokio::fs::File, length: u64) {
        if !self.begin_write("download") {
            return;
        }
        self.set_length(length);
        self.commit(Payload::File(file));
    }

    /// The terminal body write every other body writer ends in.
    ///
    /// Sets an `ETag` if the handler did not, turns the status into 304
    /// when `request` is fresh, strips the body and entity headers for 204
    /// and 304, and elides the body for HEAD.
    pub(crate) fn raw(&mut self, request: &Request, data: Bytes) {
        if !self.begin_write("raw") {
            return;
        }

        if self.header(ETAG.as_str()).is_none_or(str::is_empty) {
            let etag = format!("\"{:x}\"", Sha256::digest(&data));
            self.set_header(ETAG.as_str(), &etag);
        }
        if request.is_fresh(self.status, &self.headers) {
            self.status = 304;
        }

        let mut data = data;
        if self.status == 204 || self.status == 304 {
            self.headers.remove(CONTENT_TYPE);
            self.headers.remove(CONTENT_LENGTH);
            self.headers.remove(TRANSFER_ENCODING);
            data = Bytes::new();
        }
        if request.method() == http::Method::HEAD.as_str() {
            data = Bytes::new();
        }

        self.commit(if data.is_empty() { Payload::Empty } else { Payload::Bytes(data) });
    }

    /// Consumes the state into the response handed to hyper.
    pub(crate) fn into_http(self) -> http::Response<ResponseBody> {
        let body = match self.payload {
            Payload::Empty => empty_body(),
            Payload::Bytes(bytes) => full_body(bytes),
            Payload::File(file) => StreamBody::new(ReaderStream::new(file).map_ok(Frame::data)).boxed_unsync(),
        };
        let mut res = http::Response::new(body);
        *res.status_mut() = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        *res.headers_mut() = self.headers;
        res
    }
}

impl Default for ResponseState {
    fn default() -> Self { Self::new() }
}

pub(crate) fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

pub(crate) fn empty_body() -> ResponseBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// A complete `text/plain` response outside of any request context.
pub fn plain_text(status: StatusCode, body: impl Into<Bytes>) -> http::Response<ResponseBody> {
    let mut res = http::Response::new(full_body(body));
    *res.status_mut() = status;
    res.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(ContentType::Text.as_str()));
    res
}
