//! Fault boundary around user callbacks.
//!
//! Every call into a table resolver, hook or column resolver runs through
//! [`catch_panic`]. A panic is turned into a [`Panic`] value carrying the
//! message and the backtrace of the panicking thread; it never unwinds past
//! the boundary.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

use futures::FutureExt;
use tracing::warn;

tokio::task_local! {
    static GUARDED: ();
}

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// A recovered panic.
#[derive(Debug, Clone)]
pub struct Panic {
    pub message: String,
    pub backtrace: String,
}

/// Install the process-wide panic hook that records backtraces for
/// [`catch_panic`]. Idempotent. Panics outside a guarded scope still go to
/// the previously installed hook.
pub fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if GUARDED.try_with(|_| ()).is_ok() {
                let trace = Backtrace::force_capture().to_string();
                LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            } else {
                previous(info);
            }
        }));
    });
}

/// Run `fut` to completion, converting a panic into `Err(Panic)`.
pub async fn catch_panic<F: Future>(fut: F) -> Result<F::Output, Panic> {
    install_panic_hook();
    GUARDED
        .scope((), AssertUnwindSafe(fut).catch_unwind())
        .await
        .map_err(|payload| {
            let message = if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else {
                "unknown panic".to_string()
            };
            let backtrace = LAST_BACKTRACE
                .with(|slot| slot.borrow_mut().take())
                .unwrap_or_else(|| "<no backtrace captured>".to_string());
            Panic { message, backtrace }
        })
}

// ── Crash reporting ──────────────────────────────────────────────────

/// Where a recovered panic happened.
#[derive(Debug, Clone)]
pub struct Crash {
    pub table: String,
    pub client: String,
    pub column: Option<String>,
    pub message: String,
    pub backtrace: String,
}

/// External crash-reporting sink. Called once per recovered panic, after it
/// has been logged and counted.
pub trait CrashReporter: Send + Sync {
    fn report(&self, crash: &Crash);
}

/// Default reporter: one warning line per crash, without the stack (the
/// boundary that caught the panic has already logged it).
#[derive(Debug, Default)]
pub struct TracingReporter;

impl CrashReporter for TracingReporter {
    fn report(&self, crash: &Crash) {
        warn!(
            table = %crash.table,
            client = %crash.client,
            column = crash.column.as_deref().unwrap_or(""),
            error = %crash.message,
            "crash reported"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_through_normal_output() {
        let out = catch_panic(async { 41 + 1 }).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn converts_str_panic() {
        let err = catch_panic(async {
            panic!("boom");
        })
        .await
        .unwrap_err();
        assert_eq!(err.message, "boom");
        assert!(!err.backtrace.is_empty());
    }

    #[tokio::test]
    async fn converts_formatted_panic() {
        let value = 7;
        let err = catch_panic(async move {
            if value > 0 {
                panic!("bad value {value}");
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err.message, "bad value 7");
    }

    #[tokio::test]
    async fn panic_after_await_is_caught() {
        let err = catch_panic(async {
            tokio::task::yield_now().await;
            let v: Vec<i32> = Vec::new();
            v[3]
        })
        .await
        .unwrap_err();
        assert!(err.message.contains("index out of bounds"));
    }
}
