//! Cooperative cancellation and device release.
//!
//! - [`StopFlag`]: shared flag the lock-in sampler polls once per poll
//!   interval. Triggered from Ctrl-C, a host "stop" button, or a [`PanicGuard`].
//! - [`PanicGuard`]: RAII guard that runs a synchronous action on drop,
//!   typically triggering a [`StopFlag`] when a task unwinds.
//! - [`CleanupRegistry`]: ordered list of async release actions (park the
//!   servo, close the meter, stop the camera) executed LIFO by a procedure's
//!   `finalize` step.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

// =============================================================================
// Stop Flag
// =============================================================================

/// Shared stop request, cheap to clone across tasks.
#[derive(Clone, Debug, Default)]
pub struct StopFlag {
    flag: Arc<AtomicBool>,
    reason: Arc<RwLock<Option<String>>>,
}

impl StopFlag {
    /// Create a flag in the "running" state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. The first reason wins.
    pub fn trigger(&self, reason: impl Into<String>) {
        if let Ok(mut r) = self.reason.write() {
            if r.is_none() {
                *r = Some(reason.into());
            }
        }
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Reason passed to the first [`trigger`](Self::trigger) call.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().ok().and_then(|r| r.clone())
    }

    /// Re-arm the flag for another run.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
        if let Ok(mut r) = self.reason.write() {
            *r = None;
        }
    }

    /// Guard that triggers this flag if dropped while still armed.
    #[must_use]
    pub fn guard(&self, context: impl Into<String>) -> PanicGuard {
        let flag = self.clone();
        let ctx = context.into();
        PanicGuard::named(ctx.clone(), move || {
            flag.trigger(format!("panic in {ctx}"));
        })
    }
}

// =============================================================================
// Panic Guard
// =============================================================================

/// Runs a synchronous action when dropped unless dismissed.
pub struct PanicGuard {
    action: Option<Box<dyn FnOnce() + Send + 'static>>,
    name: String,
}

impl PanicGuard {
    /// Guard with a name used in log output.
    pub fn named<F>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            action: Some(Box::new(action)),
            name: name.into(),
        }
    }

    /// Disarm the guard; the action will not run.
    pub fn dismiss(mut self) {
        self.action = None;
    }

    /// Whether the action is still pending.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.action.is_some()
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            if std::thread::panicking() {
                tracing::error!(guard = %self.name, "guard dropped during panic");
            }
            // Never let the guard action turn a panic into an abort.
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(action)).is_err() {
                tracing::error!(guard = %self.name, "guard action panicked");
            }
        }
    }
}

// =============================================================================
// Cleanup Registry
// =============================================================================

/// Boxed async release action.
pub type CleanupAction = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Named async actions run in reverse registration order.
#[derive(Default)]
pub struct CleanupRegistry {
    actions: Vec<(String, CleanupAction)>,
}

impl CleanupRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an action. Registering an existing name replaces the old action.
    pub fn register(&mut self, name: impl Into<String>, action: CleanupAction) {
        let name = name.into();
        self.actions.retain(|(n, _)| *n != name);
        self.actions.push((name, action));
    }

    /// Run every action, most recent first, leaving the registry empty.
    pub async fn run_all(&mut self) {
        while let Some((name, action)) = self.actions.pop() {
            tracing::debug!(action = %name, "running cleanup");
            action().await;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.actions.iter().map(|(n, _)| n))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn stop_flag_keeps_first_reason() {
        let flag = StopFlag::new();
        assert!(!flag.is_triggered());

        flag.trigger("user");
        flag.trigger("timeout");
        assert!(flag.is_triggered());
        assert_eq!(flag.reason().as_deref(), Some("user"));

        flag.reset();
        assert!(!flag.is_triggered());
        assert_eq!(flag.reason(), None);
    }

    #[test]
    fn clones_share_state() {
        let flag = StopFlag::new();
        let other = flag.clone();
        other.trigger("ctrl-c");
        assert!(flag.is_triggered());
    }

    #[test]
    fn guard_triggers_flag_on_panic() {
        let flag = StopFlag::new();
        let inner = flag.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = inner.guard("sampler");
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(flag.is_triggered());
        assert_eq!(flag.reason().as_deref(), Some("panic in sampler"));
    }

    #[test]
    fn dismissed_guard_does_nothing() {
        let flag = StopFlag::new();
        let guard = flag.guard("ok");
        assert!(guard.is_armed());
        guard.dismiss();
        assert!(!flag.is_triggered());
    }

    #[tokio::test]
    async fn cleanup_runs_lifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CleanupRegistry::new();

        for name in ["servo", "meter"] {
            let order = order.clone();
            registry.register(
                name,
                Box::new(move || {
                    Box::pin(async move {
                        order.lock().unwrap().push(name);
                    })
                }),
            );
        }
        assert_eq!(registry.len(), 2);

        registry.run_all().await;
        assert!(registry.is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["meter", "servo"]);
    }

    #[tokio::test]
    async fn register_same_name_replaces() {
        let mut registry = CleanupRegistry::new();
        registry.register("camera", Box::new(|| Box::pin(async {})));
        registry.register("camera", Box::new(|| Box::pin(async {})));
        assert_eq!(registry.len(), 1);
    }
}
