use std::{future::Future, sync::Arc};

use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, warn};

use crate::lifecycle::AppLifecycleBroadcaster;

/// Upper bound on attempts; `None` retries on every foreground transition
/// until the work succeeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded { attempts: u32 },
    GaveUp { attempts: u32 },
    Abandoned { attempts: u32 },
}

/// Fallible work retried across foreground transitions.
///
/// The first attempt runs immediately. After a failure the task sleeps until
/// the broadcaster reports the app active again; nothing runs while the app
/// stays in the background. On success the lifecycle subscription is dropped
/// and the task ends.
pub struct PersistentTask;

impl PersistentTask {
    pub fn spawn<F, Fut>(
        lifecycle: &Arc<AppLifecycleBroadcaster>,
        policy: RetryPolicy,
        label: &'static str,
        task: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        drop(Self::spawn_tracked(lifecycle, policy, label, task));
    }

    pub fn spawn_tracked<F, Fut>(
        lifecycle: &Arc<AppLifecycleBroadcaster>,
        policy: RetryPolicy,
        label: &'static str,
        mut task: F,
    ) -> JoinHandle<TaskOutcome>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let foreground = Arc::new(Notify::new());
        let subscription = {
            let foreground = Arc::clone(&foreground);
            lifecycle.subscribe(Some(Arc::new(move || foreground.notify_one())), None)
        };
        let mut phases = lifecycle.phase_changes();

        tokio::spawn(async move {
            let mut attempts = 0u32;
            loop {
                attempts += 1;
                match task().await {
                    Ok(()) => {
                        subscription.unsubscribe();
                        debug!(task = label, attempts, "persistent task finished");
                        return TaskOutcome::Succeeded { attempts };
                    }
                    Err(error) => {
                        warn!(
                            task = label,
                            attempts,
                            %error,
                            "persistent task failed; waiting for foreground"
                        );
                    }
                }

                if policy.max_attempts.is_some_and(|max| attempts >= max) {
                    subscription.unsubscribe();
                    warn!(task = label, attempts, "persistent task gave up");
                    return TaskOutcome::GaveUp { attempts };
                }

                loop {
                    tokio::select! {
                        _ = foreground.notified() => {
                            // A stale wakeup can arrive after the app went back to the background.
                            if phases.borrow().is_active() {
                                break;
                            }
                        }
                        changed = phases.changed() => {
                            if changed.is_err() {
                                debug!(
                                    task = label,
                                    attempts,
                                    "lifecycle gone; abandoning persistent task"
                                );
                                return TaskOutcome::Abandoned { attempts };
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/persistent_task_tests.rs"]
mod tests;
