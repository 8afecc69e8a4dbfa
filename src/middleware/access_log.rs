use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures_util::FutureExt;
use tracing::info;

use super::Next;
use crate::context::Context;

/// Logs every request on arrival and on completion with its cost and status.
///
/// A panic further down is still logged, as a 500, then passed on to the
/// recovery boundary.
pub async fn access_log(ctx: Context, next: Next) {
    let start = Instant::now();
    info!(
        method = ctx.method(),
        uri = ctx.uri(),
        host = %ctx.host(),
        protocol = ctx.protocol(),
        "request incoming"
    );

    let outcome = AssertUnwindSafe(next.run()).catch_unwind().await;

    let status = if outcome.is_err() { 500 } else { ctx.status_code() };
    info!(cost_ms = start.elapsed().as_secs_f64() * 1e3, status, "request completed");

    if let Err(payload) = outcome {
        std::panic::resume_unwind(payload);
    }
}
