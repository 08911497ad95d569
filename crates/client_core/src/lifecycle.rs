//! Foreground/background notifications for the whole client.
//!
//! The host platform feeds phase signals in; the broadcaster first resumes or
//! pauses the message session and then fans the transition out to every
//! registered listener, in registration order.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::subscription::{Registry, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppPhase {
    Active,
    Inactive,
    Background,
}

impl AppPhase {
    pub fn is_active(self) -> bool {
        matches!(self, AppPhase::Active)
    }
}

pub type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;

/// Session-level reaction to lifecycle transitions, run before listeners.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    async fn resume(&self);
    async fn pause(&self);
}

#[derive(Clone)]
struct LifecycleListener {
    on_active: Option<LifecycleCallback>,
    on_inactive: Option<LifecycleCallback>,
}

pub struct AppLifecycleBroadcaster {
    phase: watch::Sender<AppPhase>,
    listeners: Registry<LifecycleListener>,
    hooks: RwLock<Option<Arc<dyn SessionHooks>>>,
    signal_task: Mutex<Option<JoinHandle<()>>>,
    dispatch: tokio::sync::Mutex<()>,
}

impl AppLifecycleBroadcaster {
    pub fn new(initial_phase: AppPhase) -> Arc<Self> {
        let (phase, _) = watch::channel(initial_phase);
        Arc::new(Self {
            phase,
            listeners: Registry::new(),
            hooks: RwLock::new(None),
            signal_task: Mutex::new(None),
            dispatch: tokio::sync::Mutex::new(()),
        })
    }

    pub fn attach_session_hooks(&self, hooks: Arc<dyn SessionHooks>) {
        *self.hooks.write().unwrap_or_else(PoisonError::into_inner) = Some(hooks);
    }

    /// Starts consuming host phase signals. Ignored while already listening.
    pub fn init(self: &Arc<Self>, mut signals: mpsc::UnboundedReceiver<AppPhase>) {
        let mut slot = self
            .signal_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            warn!("lifecycle broadcaster already listening; init ignored");
            return;
        }

        let broadcaster = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            while let Some(phase) = signals.recv().await {
                let Some(broadcaster) = broadcaster.upgrade() else {
                    break;
                };
                broadcaster.handle(phase).await;
            }
            debug!("lifecycle signal source closed");
        }));
    }

    /// Stops consuming host signals. Registered listeners are kept.
    pub fn destroy(&self) {
        let task = self
            .signal_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    pub fn subscribe(
        &self,
        on_active: Option<LifecycleCallback>,
        on_inactive: Option<LifecycleCallback>,
    ) -> Subscription {
        self.listeners.insert(LifecycleListener {
            on_active,
            on_inactive,
        })
    }

    pub fn current_phase(&self) -> AppPhase {
        *self.phase.borrow()
    }

    pub fn phase_changes(&self) -> watch::Receiver<AppPhase> {
        self.phase.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Applies one host phase signal. Repeats of the current phase are ignored.
    pub async fn handle(&self, next: AppPhase) {
        let _serial = self.dispatch.lock().await;
        let previous = self.phase.send_replace(next);
        if previous == next {
            debug!(phase = ?next, "lifecycle phase unchanged");
            return;
        }
        info!(?previous, phase = ?next, "app lifecycle phase changed");

        let hooks = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hooks) = hooks {
            if next.is_active() {
                hooks.resume().await;
            } else {
                hooks.pause().await;
            }
        }

        for listener in self.listeners.snapshot() {
            let callback = if next.is_active() {
                listener.on_active
            } else {
                listener.on_inactive
            };
            let Some(callback) = callback else {
                continue;
            };
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                error!(phase = ?next, "lifecycle listener panicked");
            }
        }
    }
}

impl Drop for AppLifecycleBroadcaster {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
