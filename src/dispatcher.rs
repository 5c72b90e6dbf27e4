//! Ordered fan-out of snapshots to registered observers.
//!
//! Every publish works on a copy of the registration list taken under the
//! lock, so observers may register or unregister (including themselves)
//! from inside a delivery. An observer unregistered before its turn in an
//! in-flight publish is skipped; a delivery that already started runs to
//! completion.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::types::Category;

/// Handle returned by `register`, used to unregister
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Registration {
    category: Category,
    id: u64,
}

impl Registration {
    pub fn category(&self) -> Category {
        self.category
    }
}

struct Entry<L: ?Sized> {
    id: u64,
    active: AtomicBool,
    listener: Arc<L>,
}

/// Registry of observers for one category
pub struct StatusDispatcher<L: ?Sized> {
    category: Category,
    entries: Mutex<Vec<Arc<Entry<L>>>>,
    next_id: AtomicU64,
}

impl<L: ?Sized + Send + Sync> StatusDispatcher<L> {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append an observer; delivery order is registration order
    pub fn register(&self, listener: Arc<L>) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            id,
            active: AtomicBool::new(true),
            listener,
        });
        self.lock().push(entry);

        Registration {
            category: self.category,
            id,
        }
    }

    /// Remove an observer. Returns false if the handle was not registered here.
    pub fn unregister(&self, registration: &Registration) -> bool {
        if registration.category != self.category {
            return false;
        }

        let mut entries = self.lock();
        match entries.iter().position(|e| e.id == registration.id) {
            Some(index) => {
                let entry = entries.remove(index);
                entry.active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Deliver to every observer present when publish was called.
    ///
    /// Returns the number of observers that completed delivery.
    pub(crate) fn publish<F>(&self, deliver: F) -> usize
    where
        F: Fn(&L),
    {
        let snapshot: Vec<Arc<Entry<L>>> = self.lock().clone();
        let mut delivered = 0;

        for entry in snapshot {
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| deliver(&*entry.listener))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(
                        category = ?self.category,
                        observer = entry.id,
                        "Observer panicked during delivery: {}",
                        message
                    );
                }
            }
        }

        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Entry<L>>>> {
        // A panicking observer never holds this lock, but stay usable regardless.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    trait Probe: Send + Sync {
        fn seen(&self, value: u32);
    }

    impl<F: Fn(u32) + Send + Sync> Probe for F {
        fn seen(&self, value: u32) {
            self(value)
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<(usize, u32)>>>, tag: usize) -> Arc<dyn Probe> {
        let log = log.clone();
        Arc::new(move |value: u32| log.lock().unwrap().push((tag, value)))
    }

    #[test]
    fn every_observer_gets_every_snapshot_in_order() {
        let dispatcher: StatusDispatcher<dyn Probe> = StatusDispatcher::new(Category::MediaStatus);
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            dispatcher.register(recorder(&log, tag));
        }

        for value in 0..5 {
            assert_eq!(dispatcher.publish(|l| l.seen(value)), 3);
        }

        let log = log.lock().unwrap();
        for tag in 0..3 {
            let seen: Vec<u32> = log.iter().filter(|(t, _)| *t == tag).map(|(_, v)| *v).collect();
            assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        }
        // registration order within each publish
        let first_round: Vec<usize> = log.iter().take(3).map(|(t, _)| *t).collect();
        assert_eq!(first_round, vec![0, 1, 2]);
    }

    #[test]
    fn unregister_during_publish_skips_only_the_removed_observer() {
        let dispatcher: Arc<StatusDispatcher<dyn Probe>> =
            Arc::new(StatusDispatcher::new(Category::DeviceStatus));
        let log = Arc::new(Mutex::new(Vec::new()));
        let victim: Arc<OnceLock<Registration>> = Arc::new(OnceLock::new());

        let remover = {
            let dispatcher = dispatcher.clone();
            let victim = victim.clone();
            let log = log.clone();
            Arc::new(move |value: u32| {
                log.lock().unwrap().push((0, value));
                if let Some(reg) = victim.get() {
                    assert!(dispatcher.unregister(reg));
                }
            }) as Arc<dyn Probe>
        };
        dispatcher.register(remover);
        let reg = dispatcher.register(recorder(&log, 1));
        dispatcher.register(recorder(&log, 2));
        victim.set(reg).unwrap();

        let delivered = dispatcher.publish(|l| l.seen(10));
        assert_eq!(delivered, 2);
        assert_eq!(*log.lock().unwrap(), vec![(0, 10), (2, 10)]);
        assert_eq!(dispatcher.len(), 2);
    }

    #[test]
    fn observer_may_unregister_itself() {
        let dispatcher: Arc<StatusDispatcher<dyn Probe>> =
            Arc::new(StatusDispatcher::new(Category::DeviceStatus));
        let own: Arc<OnceLock<Registration>> = Arc::new(OnceLock::new());
        let calls = Arc::new(Mutex::new(0));

        let listener = {
            let dispatcher = dispatcher.clone();
            let own = own.clone();
            let calls = calls.clone();
            Arc::new(move |_: u32| {
                *calls.lock().unwrap() += 1;
                dispatcher.unregister(own.get().unwrap());
            }) as Arc<dyn Probe>
        };
        own.set(dispatcher.register(listener)).unwrap();

        dispatcher.publish(|l| l.seen(1));
        dispatcher.publish(|l| l.seen(2));
        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn panicking_observer_does_not_stop_fan_out() {
        let dispatcher: StatusDispatcher<dyn Probe> = StatusDispatcher::new(Category::MediaStatus);
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register(recorder(&log, 0));
        dispatcher.register(Arc::new(|_: u32| panic!("observer bug")));
        dispatcher.register(recorder(&log, 2));

        assert_eq!(dispatcher.publish(|l| l.seen(1)), 2);
        assert_eq!(dispatcher.publish(|l| l.seen(2)), 2);
        assert_eq!(*log.lock().unwrap(), vec![(0, 1), (2, 1), (0, 2), (2, 2)]);
    }

    #[test]
    fn foreign_registration_is_rejected() {
        let media: StatusDispatcher<dyn Probe> = StatusDispatcher::new(Category::MediaStatus);
        let device: StatusDispatcher<dyn Probe> = StatusDispatcher::new(Category::DeviceStatus);
        let reg = device.register(Arc::new(|_: u32| {}));
        media.register(Arc::new(|_: u32| {}));

        assert!(!media.unregister(&reg));
        assert_eq!(media.len(), 1);
        assert!(device.unregister(&reg));
        assert!(!device.unregister(&reg));
    }
}
