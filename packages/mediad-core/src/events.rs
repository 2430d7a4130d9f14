//! Event delivery seam between the service modules and the transport.
//!
//! Focus, session, graph and policy push asynchronous events at somebody:
//! in the daemon that somebody is a connection's notify channel, in tests
//! it is a recorder. [`Notifier`] is that seam; the daemon's connection type
//! implements it, so the service modules never touch sockets.

use std::sync::Arc;

/// Sink for `(event, result, extra)` notifications plus a liveness probe.
pub trait Notifier: Send + Sync {
    /// Whether the peer behind this notifier can still receive events.
    ///
    /// The focus arbiter harvests entries whose notifier reports dead on
    /// every mutating operation.
    fn alive(&self) -> bool {
        true
    }

    /// Pushes one event. Delivery is best-effort and must not block.
    fn notify(&self, event: i32, result: i32, extra: &str);

    /// Tears down the underlying notify channel, dropping queued events.
    fn finalize(&self) {}
}

/// Shared notifier handle.
pub type NotifierRef = Arc<dyn Notifier>;

/// Notifier that drops every event. Useful as a placeholder.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: i32, _result: i32, _extra: &str) {}
}

/// Notifier that logs events, for diagnostics and manual runs.
pub struct LoggingNotifier {
    label: String,
}

impl LoggingNotifier {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

impl Notifier for LoggingNotifier {
    fn notify(&self, event: i32, result: i32, extra: &str) {
        log::info!("[Event] {}: event={event} result={result} extra={extra:?}", self.label);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Records every notification and supports simulated death.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub events: Mutex<Vec<(i32, i32, String)>>,
        dead: AtomicBool,
    }

    impl RecordingNotifier {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn kill(&self) {
            self.dead.store(true, Ordering::SeqCst);
        }

        pub fn take(&self) -> Vec<(i32, i32, String)> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl Notifier for RecordingNotifier {
        fn alive(&self) -> bool {
            !self.dead.load(Ordering::SeqCst)
        }

        fn notify(&self, event: i32, result: i32, extra: &str) {
            self.events.lock().push((event, result, extra.to_string()));
        }
    }
}
