//! Process-wide cooperative cancellation for long batched operations.
//!
//! A single global callback is polled between work chunks; when it
//! reports an interrupt the in-flight batch stops cleanly, partial
//! results are discarded and [`Error::Interrupted`] is surfaced.

use parking_lot::RwLock;

use crate::error::{Error, Result};

type Callback = Box<dyn Fn() -> bool + Send + Sync>;

static CALLBACK: RwLock<Option<Callback>> = RwLock::new(None);

/// Installs the global interrupt callback, replacing any previous one.
/// The callback returns true when the current operation should abort.
pub fn set_callback(callback: impl Fn() -> bool + Send + Sync + 'static) {
    *CALLBACK.write() = Some(Box::new(callback));
}

/// Removes the global interrupt callback.
pub fn clear_callback() {
    *CALLBACK.write() = None;
}

/// Polls the callback once. False when no callback is installed.
#[must_use]
pub fn is_interrupted() -> bool {
    CALLBACK.read().as_ref().is_some_and(|cb| cb())
}

/// Fails with [`Error::Interrupted`] when the callback reports an
/// interrupt.
pub fn check() -> Result<()> {
    if is_interrupted() {
        Err(Error::Interrupted)
    } else {
        Ok(())
    }
}

/// Number of work items to process between interrupt polls, derived from
/// the per-item floating point cost. Effectively unbounded when no
/// callback is installed.
#[must_use]
pub fn period_hint(flops_per_item: usize) -> usize {
    if CALLBACK.read().is_none() {
        return usize::MAX;
    }
    (100_000_000 / flops_per_item.saturating_add(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    #[serial(interrupt)]
    fn test_no_callback_never_interrupts() {
        clear_callback();
        assert!(!is_interrupted());
        assert!(check().is_ok());
        assert_eq!(period_hint(1000), usize::MAX);
    }

    #[test]
    #[serial(interrupt)]
    fn test_callback_signals_interrupt() {
        let flag = Arc::new(AtomicBool::new(false));
        let probe = Arc::clone(&flag);
        set_callback(move || probe.load(Ordering::Relaxed));

        assert!(check().is_ok());
        flag.store(true, Ordering::Relaxed);
        assert!(matches!(check(), Err(Error::Interrupted)));

        clear_callback();
    }

    #[test]
    #[serial(interrupt)]
    fn test_period_hint_scales_with_cost() {
        set_callback(|| false);
        assert!(period_hint(10) > period_hint(100_000));
        assert!(period_hint(usize::MAX - 1) >= 1);
        clear_callback();
    }
}
