// ============================================
// File: crates/warren-server/src/signal.rs
// ============================================
//! # Signal Latches
//!
//! ## Creation Reason
//! The event loop must never be interrupted mid-packet; signals are
//! latched into flags that the loop examines at its top, exactly once
//! per delivery.
//!
//! ## Main Functionality
//! - `SignalFlags`: latched USR1 / HUP / TERM flags
//! - Unix signal listeners feeding the latches
//! - A notifier so the loop's wait wakes promptly
//!
//! ## Semantics
//! - `USR1`: soft restart - close idle instances, keep running
//! - `HUP`: hard restart - drain everything and return
//! - `TERM` (and Ctrl+C): drain everything and exit
//!
//! ## ⚠️ Important Note for Next Developer
//! - `take_*` consumes the latch; check each flag once per loop pass
//! - Latches may coalesce repeated deliveries; that is intended

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, info};

// ============================================
// SignalFlags
// ============================================

/// Latched signal state shared between listeners and the event loop.
#[derive(Debug, Default)]
pub struct SignalFlags {
    term: AtomicBool,
    hup: AtomicBool,
    usr1: AtomicBool,
    notify: Notify,
}

impl SignalFlags {
    /// Creates unlatched flags.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Spawns the Unix signal listeners feeding these latches.
    ///
    /// On non-Unix platforms only Ctrl+C is wired (to `TERM`).
    pub fn install(self: &Arc<Self>) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            for (kind, name) in [
                (SignalKind::terminate(), "TERM"),
                (SignalKind::hangup(), "HUP"),
                (SignalKind::user_defined1(), "USR1"),
            ] {
                let flags = Arc::clone(self);
                tokio::spawn(async move {
                    let Ok(mut stream) = signal(kind) else {
                        debug!("cannot listen for SIG{}", name);
                        return;
                    };
                    while stream.recv().await.is_some() {
                        info!("SIG{} received", name);
                        match name {
                            "TERM" => flags.raise_term(),
                            "HUP" => flags.raise_hup(),
                            _ => flags.raise_usr1(),
                        }
                    }
                });
            }
        }

        let flags = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received");
                flags.raise_term();
            }
        });
    }

    // ========================================
    // Raising (listeners and tests)
    // ========================================

    /// Latches TERM.
    pub fn raise_term(&self) {
        self.term.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Latches HUP.
    pub fn raise_hup(&self) {
        self.hup.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Latches USR1.
    pub fn raise_usr1(&self) {
        self.usr1.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    // ========================================
    // Consuming (event loop)
    // ========================================

    /// Consumes the TERM latch.
    pub fn take_term(&self) -> bool {
        self.term.swap(false, Ordering::AcqRel)
    }

    /// Consumes the HUP latch.
    pub fn take_hup(&self) -> bool {
        self.hup.swap(false, Ordering::AcqRel)
    }

    /// Consumes the USR1 latch.
    pub fn take_usr1(&self) -> bool {
        self.usr1.swap(false, Ordering::AcqRel)
    }

    /// Parks until any signal is raised.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latches_consume_once() {
        let flags = SignalFlags::new();

        flags.raise_term();
        assert!(flags.take_term());
        assert!(!flags.take_term());

        flags.raise_usr1();
        assert!(!flags.take_hup());
        assert!(flags.take_usr1());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_raise() {
        let flags = SignalFlags::new();
        let waiter = Arc::clone(&flags);

        let handle = tokio::spawn(async move {
            waiter.wait().await;
            waiter.take_hup()
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        flags.raise_hup();

        assert!(handle.await.unwrap());
    }
}
