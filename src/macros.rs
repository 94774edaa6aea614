// At most one event per `$dur` milliseconds per call site. The emitted event carries how many
// were suppressed since the previous one.
macro_rules! log_every_ms {
    ($dur:expr, $level:expr, $($rest:tt)*) => {{
        use ::std::sync::atomic::{AtomicU64, Ordering};

        static NEXT_ALLOWED_MS: AtomicU64 = AtomicU64::new(0);
        static SUPPRESSED: AtomicU64 = AtomicU64::new(0);

        let now_ms = crate::utils::monotonic_ms();
        let next = NEXT_ALLOWED_MS.load(Ordering::Relaxed);
        if now_ms >= next
            && NEXT_ALLOWED_MS
                .compare_exchange(next, now_ms + $dur, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            let suppressed = SUPPRESSED.swap(0, Ordering::Relaxed);
            tracing::event!($level, suppressed, $($rest)*);
        } else {
            SUPPRESSED.fetch_add(1, Ordering::Relaxed);
        }
    }};
}

macro_rules! debug_every_ms {
    ($dur:expr, $($rest:tt)*) => {
        log_every_ms!($dur, tracing::Level::DEBUG, $($rest)*);
    };
}

macro_rules! warn_every_ms {
    ($dur:expr, $($rest:tt)*) => {
        log_every_ms!($dur, tracing::Level::WARN, $($rest)*);
    };
}

// Runs `$maybe_change` on `$obj` and logs when `$calc` of it differs before and after.
macro_rules! log_if_changed {
    ($level:expr, $name:expr, $obj:expr, $calc:expr, $maybe_change:expr) => {
        crate::utils::run_before_and_after_if_changed($obj, $calc, $maybe_change, |_, before, after| {
            tracing::event!($level, before=?before, after=?after, "{} changed", $name);
        })
    };
}
