use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, Weak,
};

pub type SubscriptionId = u64;

struct Entries<T> {
    next_id: SubscriptionId,
    items: Vec<(SubscriptionId, T)>,
}

/// Ordered set of registered handlers. Removal is by id, never by value.
pub struct Registry<T> {
    entries: Arc<Mutex<Entries<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                next_id: 0,
                items: Vec::new(),
            })),
        }
    }
}

impl<T: Clone + Send + 'static> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, value: T) -> Subscription {
        let id = {
            let mut entries = lock(&self.entries);
            let id = entries.next_id;
            entries.next_id += 1;
            entries.items.push((id, value));
            id
        };

        let entries: Weak<Mutex<Entries<T>>> = Arc::downgrade(&self.entries);
        Subscription::new(move || {
            if let Some(entries) = entries.upgrade() {
                lock(&entries).items.retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Copies the handlers out so dispatch never runs under the lock.
    pub fn snapshot(&self) -> Vec<T> {
        lock(&self.entries)
            .items
            .iter()
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by every subscribe operation.
///
/// `unsubscribe` runs the removal at most once; later calls do nothing.
#[must_use = "dropping a Subscription keeps the handler registered"]
pub struct Subscription {
    cancel: Option<Box<dyn Fn() + Send + Sync>>,
    cancelled: AtomicBool,
}

impl Subscription {
    pub fn new(cancel: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn noop() -> Self {
        Self {
            cancel: None,
            cancelled: AtomicBool::new(true),
        }
    }

    pub fn unsubscribe(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cancel) = &self.cancel {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
