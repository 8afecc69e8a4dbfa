use super::Next;
use crate::context::Context;

const MAX_AGE_SECS: &str = "172800";

/// Adds the configured CORS headers and answers preflight requests itself.
pub async fn cors(ctx: Context, next: Next) {
    let cors = &ctx.app().config().cors;
    ctx.set_header("x-powered-by", "flow");
    if !cors.allow_origin.is_empty() {
        ctx.set_header("access-control-allow-origin", &cors.allow_origin);
    }
    if !cors.allowed_methods.is_empty() {
        ctx.set_header("access-control-allow-methods", &cors.allowed_methods);
    }
    if !cors.allowed_headers.is_empty() {
        ctx.set_header("access-control-allow-headers", &cors.allowed_headers);
    }
    ctx.set_header("access-control-max-age", MAX_AGE_SECS);

    if ctx.method() == http::Method::OPTIONS.as_str() {
        ctx.text("true");
        return;
    }
    next.run().await;
}
