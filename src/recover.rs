//! Panic recovery and not-found hooks.
//!
//! A panic anywhere in a route's middleware chain or handler is caught once,
//! at dispatch, and handed to the [`PanicHandler`]. Requests that match no
//! route go to the [`NotFoundHandler`]. Both are set on the
//! [`ApplicationBuilder`](crate::ApplicationBuilder).

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::sync::{Arc, Once};

use http::request::Parts;
use http::{HeaderValue, StatusCode};
use tracing::error;

use crate::response::{ResponseBody, plain_text};

/// Turns a recovered panic payload into the response sent to the client.
pub type PanicHandler =
    Arc<dyn Fn(&Parts, Box<dyn Any + Send>) -> http::Response<ResponseBody> + Send + Sync>;

/// Answers requests no route matched.
pub type NotFoundHandler = Arc<dyn Fn(&Parts) -> http::Response<ResponseBody> + Send + Sync>;

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

/// Installs, once per process, a panic hook that keeps the backtrace of the
/// panicking thread for [`take_panic_backtrace`]. The previous hook still runs.
pub(crate) fn install_backtrace_hook() {
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

/// The backtrace of the last panic on this thread, if one was recorded and
/// not yet taken.
pub fn take_panic_backtrace() -> Option<String> {
    LAST_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(e) = payload.downcast_ref::<crate::Error>() {
        e.to_string()
    } else if let Some(e) = payload.downcast_ref::<Box<dyn std::error::Error + Send + Sync>>() {
        e.to_string()
    } else {
        "unknown server error".to_owned()
    }
}

/// 500 with the panic message as a plain-text body; logs the backtrace.
pub fn default_panic_handler(parts: &Parts, payload: Box<dyn Any + Send>) -> http::Response<ResponseBody> {
    let message = panic_message(&*payload);
    let backtrace = take_panic_backtrace().unwrap_or_else(|| "<unavailable>".to_owned());
    error!(
        method = %parts.method,
        uri = %parts.uri,
        panic = %message,
        backtrace = %backtrace,
        "request panicked"
    );
    plain_text(StatusCode::INTERNAL_SERVER_ERROR, message)
}

/// Plain-text 404.
pub fn default_not_found(_parts: &Parts) -> http::Response<ResponseBody> {
    let mut res = plain_text(StatusCode::NOT_FOUND, "404 page not found");
    res.headers_mut().insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    res
}

#[cfg(test)]
mod tests {
    use std::panic::catch_unwind;

    use http_body_util::BodyExt;

    use super::*;

    fn parts() -> Parts {
        http::Request::get("/boom").body(()).unwrap().into_parts().0
    }

    #[test]
    fn messages_from_common_payloads() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("bang")), "bang");
        assert_eq!(panic_message(&crate::Error::KeyNotFound("k".into())), "k: key not exist");
        assert_eq!(panic_message(&42_u8), "unknown server error");
    }

    #[tokio::test]
    async fn default_panic_handler_writes_500_with_message() {
        let res = default_panic_handler(&parts(), Box::new("boom"));
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.headers()["content-type"], "text/plain; charset=utf-8");
        assert_eq!(res.into_body().collect().await.unwrap().to_bytes(), "boom");
    }

    #[tokio::test]
    async fn default_not_found_is_plain_404() {
        let res = default_not_found(&parts());
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(res.headers()["x-content-type-options"], "nosniff");
        assert_eq!(res.into_body().collect().await.unwrap().to_bytes(), "404 page not found");
    }

    #[test]
    fn backtrace_is_recorded_at_the_panic_site() {
        install_backtrace_hook();
        let _ = take_panic_backtrace();
        let caught = catch_unwind(|| -> u8 { panic!("traced") });
        assert!(caught.is_err());
        assert!(take_panic_backtrace().is_some());
        assert!(take_panic_backtrace().is_none());
    }
}
