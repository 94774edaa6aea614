use std::{future::Future, sync::LazyLock, time::Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, trace};

static PROCESS_START: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Milliseconds since the first call in this process. Never goes backwards.
pub fn monotonic_ms() -> u64 {
    PROCESS_START.elapsed().as_millis() as u64
}

#[inline(always)]
pub fn run_before_and_after_if_changed<
    'a,
    Object: 'a,
    Value: PartialEq + Copy + std::fmt::Debug + 'static,
    ChangeResult,
>(
    obj: &mut Object,
    calc: impl Fn(&Object) -> Value,
    maybe_change: impl FnOnce(&mut Object) -> ChangeResult,
    callback: impl FnOnce(&Object, &Value, &Value),
) -> ChangeResult {
    let before = calc(obj);
    let result = maybe_change(obj);
    let after = calc(obj);
    if before != after {
        callback(obj, &before, &after);
    }
    result
}

/// Spawns `fut` inside `span`. The task ends when it finishes or when `token` is cancelled.
pub fn spawn_with_cancel<F>(
    span: tracing::Span,
    token: CancellationToken,
    fut: F,
) -> JoinHandle<()>
where
    F: Future<Output = crate::Result<()>> + Send + 'static,
{
    tokio::spawn(
        async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!("task cancelled");
                }
                r = fut => match r {
                    Ok(()) => trace!("task finished"),
                    Err(e) => debug!("task finished with error: {e:#}"),
                }
            }
        }
        .instrument(span),
    )
}

pub struct FnDropGuard<F: FnOnce()> {
    f: Option<F>,
}

impl<F: FnOnce()> FnDropGuard<F> {
    pub fn new(f: F) -> Self {
        Self { f: Some(f) }
    }

    pub fn disarm(&mut self) {
        self.f = None;
    }
}

impl<F: FnOnce()> Drop for FnDropGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}
