//! Shared, version-tracked state with change notification.
//!
//! [`Observable<T>`] keeps its value in `Rc<RefCell<..>>` storage: cloning
//! a handle shares the same value and subscriber list. All mutation goes
//! through [`Observable::set`], [`Observable::update`] or
//! [`Observable::batch`]; subscribers are notified in registration order
//! after the borrow is released, so a callback may read the value.
//!
//! Inside [`Observable::batch`] notifications are deferred and a single
//! notification carrying the final value fires when the outermost batch
//! ends. Intermediate values are never observed.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

type CallbackRc<T> = Rc<dyn Fn(&T)>;
type CallbackWeak<T> = Weak<dyn Fn(&T)>;

struct ObservableInner<T> {
    value: T,
    version: u64,
    batch_depth: u32,
    /// Set when a change happened while batching.
    pending: bool,
    subscribers: Vec<CallbackWeak<T>>,
}

pub struct Observable<T> {
    inner: Rc<RefCell<ObservableInner<T>>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Observable")
            .field("value", &inner.value)
            .field("version", &inner.version)
            .field("subscriber_count", &inner.subscribers.len())
            .finish()
    }
}

impl<T: Clone + PartialEq + 'static> Observable<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ObservableInner {
                value,
                version: 0,
                batch_depth: 0,
                pending: false,
                subscribers: Vec::new(),
            })),
        }
    }

    #[must_use]
    pub fn get(&self) -> T {
        self.inner.borrow().value.clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.borrow().value)
    }

    /// Replace the value. Setting an equal value is a no-op.
    pub fn set(&self, value: T) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.value == value {
                return;
            }
            inner.value = value;
            inner.version += 1;
        }
        self.changed();
    }

    /// Mutate in place; subscribers fire only if the value changed.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        {
            let mut inner = self.inner.borrow_mut();
            let old = inner.value.clone();
            f(&mut inner.value);
            if inner.value == old {
                return;
            }
            inner.version += 1;
        }
        self.changed();
    }

    /// Run `f` with notifications deferred until it returns.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.borrow_mut().batch_depth += 1;
        let result = f();
        let flush = {
            let mut inner = self.inner.borrow_mut();
            inner.batch_depth -= 1;
            let flush = inner.batch_depth == 0 && inner.pending;
            if flush {
                inner.pending = false;
            }
            flush
        };
        if flush {
            self.notify();
        }
        result
    }

    /// Subscribe to changes. Dropping the returned guard unsubscribes.
    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> Subscription {
        let strong: CallbackRc<T> = Rc::new(callback);
        self.inner
            .borrow_mut()
            .subscribers
            .push(Rc::downgrade(&strong));
        Subscription {
            _guard: Box::new(strong),
        }
    }

    /// Increments by one for each value-changing mutation.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.borrow().version
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().subscribers.len()
    }

    fn changed(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.batch_depth > 0 {
                inner.pending = true;
                return;
            }
        }
        self.notify();
    }

    fn notify(&self) {
        let (callbacks, value) = {
            let mut inner = self.inner.borrow_mut();
            inner.subscribers.retain(|w| w.strong_count() > 0);
            let callbacks: Vec<CallbackRc<T>> =
                inner.subscribers.iter().filter_map(Weak::upgrade).collect();
            (callbacks, inner.value.clone())
        };
        for callback in &callbacks {
            callback(&value);
        }
    }
}

/// RAII guard for a subscriber callback.
pub struct Subscription {
    _guard: Box<dyn std::any::Any>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn set_equal_value_is_noop() {
        let obs = Observable::new(1);
        obs.set(1);
        assert_eq!(obs.version(), 0);
        obs.set(2);
        assert_eq!(obs.version(), 1);
        assert_eq!(obs.get(), 2);
    }

    #[test]
    fn subscribers_see_new_value() {
        let obs = Observable::new(0);
        let seen = Rc::new(Cell::new(0));
        let seen_clone = Rc::clone(&seen);
        let _sub = obs.subscribe(move |v| seen_clone.set(*v));
        obs.update(|v| *v = 7);
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn dropped_subscription_stops_notifications() {
        let obs = Observable::new(0);
        let calls = Rc::new(Cell::new(0));
        let calls_clone = Rc::clone(&calls);
        let sub = obs.subscribe(move |_| calls_clone.set(calls_clone.get() + 1));
        obs.set(1);
        drop(sub);
        obs.set(2);
        assert_eq!(calls.get(), 1);
        assert_eq!(obs.subscriber_count(), 0);
    }

    #[test]
    fn batch_coalesces_into_one_notification() {
        let obs = Observable::new(0);
        let calls = Rc::new(Cell::new(0));
        let last = Rc::new(Cell::new(0));
        let (calls_clone, last_clone) = (Rc::clone(&calls), Rc::clone(&last));
        let _sub = obs.subscribe(move |v| {
            calls_clone.set(calls_clone.get() + 1);
            last_clone.set(*v);
        });
        obs.batch(|| {
            obs.set(1);
            obs.batch(|| obs.set(2));
            obs.set(3);
        });
        assert_eq!(calls.get(), 1);
        assert_eq!(last.get(), 3);
        assert_eq!(obs.version(), 3);
    }

    #[test]
    fn batch_without_changes_is_silent() {
        let obs = Observable::new(5);
        let calls = Rc::new(Cell::new(0));
        let calls_clone = Rc::clone(&calls);
        let _sub = obs.subscribe(move |_| calls_clone.set(calls_clone.get() + 1));
        obs.batch(|| obs.set(5));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn subscriber_may_read_during_notify() {
        let obs = Observable::new(0);
        let reader = obs.clone();
        let seen = Rc::new(Cell::new(0));
        let seen_clone = Rc::clone(&seen);
        let _sub = obs.subscribe(move |_| seen_clone.set(reader.get()));
        obs.set(9);
        assert_eq!(seen.get(), 9);
    }
}
