//! Per-request context.
//!
//! A [`Context`] is built once per dispatched request and handed to every
//! middleware and the handler. It is a cheap handle (one `Arc`), so
//! middleware can keep a copy across `next.run().await` and handlers can
//! move one into spawned work.

use std::any::Any;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use http::header::CONTENT_TYPE;
use http_body_util::{BodyExt, Limited};
use hyper::body::Body;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{Instrument, Span, error, info_span, warn};

use crate::app::Application;
use crate::error::Result;
use crate::http_client::HttpClient;
use crate::jwt::Jwt;
use crate::orm::Orm;
use crate::params::{Bind, FileHeader, FromParam, Params};
use crate::redis_client::RedisClient;
use crate::request::Request;
use crate::response::{ContentType, ResponseBody, ResponseState};

type UserData = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// Request, response, merged parameters and shared collaborators of one
/// request.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    app: Application,
    id: i64,
    request: Request,
    params: Params,
    response: Mutex<ResponseState>,
    data: RwLock<UserData>,
    span: Span,
}

impl Context {
    /// Reads the body, merges parameters and opens the request span.
    ///
    /// Multipart bodies stream straight into the form parser. Any other
    /// body is read whole, up to the configured size limit; a read failure
    /// is logged and recorded, and the request still runs.
    pub(crate) async fn new<B>(
        app: Application,
        id: i64,
        req: http::Request<B>,
        path_params: Vec<(String, String)>,
        remote_addr: SocketAddr,
    ) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let ua = parts.headers
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let span = info_span!("request", request_id = id, ua = %ua);
        let content_type = parts.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let server = &app.config().server;

        let (request, params) = if content_type.as_deref().is_some_and(is_multipart) {
            let request = Request::new(parts, remote_addr, server.proxy, Ok(Bytes::new()));
            let mut params = Params::build(path_params, request.querystring(), None, None).await;
            params
                .insert_multipart(content_type.as_deref().unwrap_or_default(), body.into_data_stream())
                .instrument(span.clone())
                .await;
            (request, params)
        } else {
            let body = Limited::new(body, server.max_body_bytes)
                .collect()
                .await
                .map(|c| c.to_bytes())
                .map_err(|e| e.to_string());
            if let Err(e) = &body {
                span.in_scope(|| warn!(error = %e, "request body unreadable"));
            }
            let request = Request::new(parts, remote_addr, server.proxy, body);
            let params = Params::build(
                path_params,
                request.querystring(),
                content_type.as_deref(),
                request.raw_body().ok(),
            )
            .instrument(span.clone())
            .await;
            (request, params)
        };

        Self {
            inner: Arc::new(Inner {
                app,
                id,
                request,
                params,
                response: Mutex::new(ResponseState::new()),
                data: RwLock::new(HashMap::new()),
                span,
            }),
        }
    }

    /// Hands the finished response to the dispatcher, leaving an empty one behind.
    pub(crate) fn take_response(&self) -> http::Response<ResponseBody> {
        std::mem::take(&mut *self.inner.response.lock()).into_http()
    }

    pub fn request_id(&self) -> i64 { self.inner.id }
    pub fn app(&self) -> &Application { &self.inner.app }

    /// The `request` span carrying `request_id` and `ua`. Instrument work
    /// spawned from a handler with it to keep those fields.
    pub fn span(&self) -> &Span { &self.inner.span }

    // ── Request ──────────────────────────────────────────────────────────────

    pub fn request(&self) -> &Request { &self.inner.request }
    pub fn headers(&self) -> &HeaderMap { self.inner.request.headers() }
    pub fn header(&self, name: &str) -> Option<&str> { self.inner.request.header(name) }
    pub fn method(&self) -> &str { self.inner.request.method() }
    pub fn uri(&self) -> &str { self.inner.request.uri() }
    pub fn query(&self) -> HashMap<String, Vec<String>> { self.inner.request.query() }
    pub fn querystring(&self) -> &str { self.inner.request.querystring() }
    pub fn host(&self) -> String { self.inner.request.host() }
    pub fn hostname(&self) -> String { self.inner.request.hostname() }
    pub fn protocol(&self) -> &str { self.inner.request.protocol() }
    pub fn is_secure(&self) -> bool { self.inner.request.is_secure() }
    pub fn origin(&self) -> String { self.inner.request.origin() }
    pub fn href(&self) -> String { self.inner.request.href() }
    pub fn content_length(&self) -> u64 { self.inner.request.content_length() }
    pub fn user_agent(&self) -> &str { self.inner.request.user_agent() }
    pub fn client_ip(&self) -> String { self.inner.request.client_ip() }

    /// The request body, read once at dispatch.
    pub fn raw_body(&self) -> Result<&Bytes> { self.inner.request.raw_body() }

    /// Whether the response as it stands now would be a cache hit for the client.
    pub fn is_fresh(&self) -> bool {
        let response = self.inner.response.lock();
        self.inner.request.is_fresh(response.status(), response.headers())
    }

    // ── Parameters ───────────────────────────────────────────────────────────

    pub fn params(&self) -> &Params { &self.inner.params }

    /// Merged parameter `key` as `T`, zero when absent.
    pub fn param<T: FromParam>(&self, key: &str) -> T { self.inner.params.value(key) }

    /// Merged parameter `key` as `T`, `default` when absent or zero.
    pub fn param_or<T: FromParam>(&self, key: &str, default: T) -> T {
        self.inner.params.value_or(key, default)
    }

    pub fn string_param(&self, key: &str) -> String { self.param(key) }
    pub fn string_param_or(&self, key: &str, default: &str) -> String {
        self.param_or(key, default.to_owned())
    }
    pub fn int_param(&self, key: &str) -> i32 { self.param(key) }
    pub fn int_param_or(&self, key: &str, default: i32) -> i32 { self.param_or(key, default) }
    pub fn int64_param(&self, key: &str) -> i64 { self.param(key) }
    pub fn int64_param_or(&self, key: &str, default: i64) -> i64 { self.param_or(key, default) }
    pub fn float64_param(&self, key: &str) -> f64 { self.param(key) }
    pub fn float64_param_or(&self, key: &str, default: f64) -> f64 { self.param_or(key, default) }
    pub fn bool_param(&self, key: &str) -> bool { self.param(key) }
    pub fn bool_param_or(&self, key: &str, default: bool) -> bool { self.param_or(key, default) }

    /// Binds the merged parameters onto `T`. See [`Bind`].
    pub fn parse<T: Bind>(&self) -> Result<T> { self.inner.params.parse() }

    pub fn form_file(&self, name: &str) -> Option<&FileHeader> { self.inner.params.file(name) }

    // ── Shared user data ─────────────────────────────────────────────────────

    /// Stores `value` under `key` for later middleware or the handler.
    pub fn set_data<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.data.write().insert(key.into(), Arc::new(value));
    }

    /// The value under `key` if it exists and is a `T`.
    pub fn get_data<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.inner.data.read().get(key).cloned().and_then(|v| v.downcast::<T>().ok())
    }

    // ── Response ─────────────────────────────────────────────────────────────

    pub fn set_header(&self, name: &str, value: &str) -> &Self {
        self.inner.response.lock().set_header(name, value);
        self
    }

    pub fn set_status(&self, code: u16) -> &Self {
        self.inner.response.lock().set_status(code);
        self
    }

    pub fn set_length(&self, length: u64) -> &Self {
        self.inner.response.lock().set_length(length);
        self
    }

    /// The status the response will be sent with, 200 if never set.
    pub fn status_code(&self) -> u16 { self.inner.response.lock().status() }

    pub fn response_header(&self, name: &str) -> Option<String> {
        self.inner.response.lock().header(name).map(str::to_owned)
    }

    /// Whether a terminal writer has already run.
    pub fn is_written(&self) -> bool { self.inner.response.lock().is_written() }

    /// Sets `Location` and `code`; writes no body.
    pub fn redirect(&self, url: &str, code: u16) {
        self.inner.response.lock().redirect(url, code);
    }

    /// Streams a file as an attachment.
    ///
    /// Relative paths resolve against the configured static path. A missing
    /// file answers with a plain-text 404.
    pub async fn download(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.app().config().server.static_path).join(path)
        };

        let opened = match tokio::fs::File::open(&path).await {
            Ok(file) => match file.metadata().await {
                Ok(meta) if meta.is_file() => Some((file, meta.len())),
                _ => None,
            },
            Err(_) => None,
        };
        let Some((file, length)) = opened else {
            warn!(path = %path.display(), "download target not found");
            self.set_status(404)
                .set_header(CONTENT_TYPE.as_str(), ContentType::Text.as_str())
                .set_header("x-content-type-options", "nosniff");
            self.raw("404 page not found");
            return;
        };

        let filename = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        self.set_header("content-disposition", &format!("attachment; filename=\"{filename}\""))
            .set_header(CONTENT_TYPE.as_str(), ContentType::OctetStream.as_str())
            .set_header("content-transfer-encoding", "binary")
            .set_header("expires", "0")
            .set_header("cache-control", "no-store, must-revalidate");
        self.inner.response.lock().file(file, length);
    }

    /// Serializes `data` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(&self, data: &T) {
        match serde_json::to_vec(data) {
            Ok(body) => {
                self.set_header(CONTENT_TYPE.as_str(), ContentType::Json.as_str());
                self.raw(body);
            }
            Err(e) => {
                error!(error = %e, "json response could not be serialized");
                self.set_status(500);
                self.raw(Bytes::new());
            }
        }
    }

    pub fn text(&self, body: impl Into<String>) {
        self.set_header(CONTENT_TYPE.as_str(), ContentType::Text.as_str());
        self.raw(body.into());
    }

    /// Renders `template` from the view path with `data` as HTML.
    ///
    /// # Panics
    ///
    /// Panics if the template cannot be loaded or rendered; the recovery
    /// boundary turns that into a 500.
    pub fn render<T: Serialize>(&self, template: &str, data: &T) {
        let html = self.app()
            .views()
            .get_template(template)
            .and_then(|tpl| tpl.render(data));
        match html {
            Ok(html) => {
                self.set_header(CONTENT_TYPE.as_str(), ContentType::Html.as_str());
                self.raw(html);
            }
            Err(e) => panic!("render `{template}`: {e}"),
        }
    }

    /// Terminal body write. Handles freshness, 204/304 and HEAD.
    pub fn raw(&self, data: impl Into<Bytes>) {
        self.inner.response.lock().raw(&self.inner.request, data.into());
    }

    // ── Collaborators ────────────────────────────────────────────────────────

    pub fn jwt(&self) -> &Jwt { self.app().jwt() }
    pub fn http_client(&self) -> &HttpClient { self.app().http_client() }

    /// # Panics
    ///
    /// Panics if redis is not enabled.
    pub fn redis(&self) -> &RedisClient { self.app().redis() }

    /// # Panics
    ///
    /// Panics if the ORM is not enabled.
    pub fn orm(&self) -> &Orm { self.app().orm() }
}

fn is_multipart(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("multipart/form-data"))
}
