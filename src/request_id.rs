//! Monotonic request identifiers.

use std::sync::atomic::{AtomicI64, Ordering};

/// Hands out strictly increasing ids starting at 1.
///
/// One source lives in each [`Application`](crate::Application). If call A
/// happens-before call B then `id(A) < id(B)`; concurrent callers always
/// receive distinct ids.
#[derive(Debug)]
pub struct RequestIds {
    last: AtomicI64,
}

impl RequestIds {
    pub fn new() -> Self {
        Self { last: AtomicI64::new(0) }
    }

    pub fn next(&self) -> i64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for RequestIds {
    fn default() -> Self { Self::new() }
}
