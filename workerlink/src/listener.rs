//! Listener registries for worker events and lifecycle callbacks.
//!
//! Each category gets its own `ListenerSet`. Registration and removal take a
//! short write lock; notification clones a snapshot and calls listeners with no
//! lock held, so a listener may (un)register listeners from inside a callback.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

/// Worker process lifecycle callbacks.
pub trait ProcessListener: Send + Sync {
    fn on_node_exit(&self, exit_code: i32) -> anyhow::Result<()>;

    fn on_node_ready(&self, port: u16) -> anyhow::Result<()>;
}

/// Attribute-change push events.
pub trait AttributeListener: Send + Sync {
    fn on_attribute_changed(&self, data: &serde_json::Value) -> anyhow::Result<()>;
}

/// Node/worker-state push events.
pub trait NodeStateListener: Send + Sync {
    fn on_node_state(&self, data: &serde_json::Value) -> anyhow::Result<()>;
}

/// Controller connectivity.
pub trait ControllerStateListener: Send + Sync {
    fn on_connect(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_disconnect(&self, _reason: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Worker announced it is ready to serve calls.
    fn on_ready(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<F> AttributeListener for F
where
    F: Fn(&serde_json::Value) -> anyhow::Result<()> + Send + Sync,
{
    fn on_attribute_changed(&self, data: &serde_json::Value) -> anyhow::Result<()> {
        self(data)
    }
}

impl<F> NodeStateListener for F
where
    F: Fn(&serde_json::Value) -> anyhow::Result<()> + Send + Sync,
{
    fn on_node_state(&self, data: &serde_json::Value) -> anyhow::Result<()> {
        self(data)
    }
}

/// Concurrent set of listener handles.
///
/// Identity is the `Arc` allocation: removing requires the same `Arc` that was added.
pub struct ListenerSet<L: ?Sized> {
    listeners: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

fn same_listener<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Adding the same `Arc` twice is a no-op.
    pub fn add(&self, listener: Arc<L>) {
        let mut guard = self.listeners.write().unwrap_or_else(|poisoned| {
            tracing::error!("Listener set lock poisoned - recovering");
            poisoned.into_inner()
        });
        if !guard.iter().any(|l| same_listener(l, &listener)) {
            guard.push(listener);
        }
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut guard = self.listeners.write().unwrap_or_else(|poisoned| {
            tracing::error!("Listener set lock poisoned - recovering");
            poisoned.into_inner()
        });
        let before = guard.len();
        guard.retain(|l| !same_listener(l, listener));
        guard.len() != before
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<L>> {
        match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Invoke `f` on every listener in a snapshot of the set.
    ///
    /// A listener returning `Err` or panicking is logged and skipped; the rest
    /// still run. Returns the number of listeners that failed.
    pub fn notify<F>(&self, event: &'static str, f: F) -> usize
    where
        F: FnMut(&L) -> anyhow::Result<()>,
    {
        notify_all(&self.snapshot(), event, f)
    }
}

/// Invoke `f` on each listener in `listeners`, isolating failures.
pub fn notify_all<L, F>(listeners: &[Arc<L>], event: &'static str, mut f: F) -> usize
where
    L: ?Sized,
    F: FnMut(&L) -> anyhow::Result<()>,
{
    let mut failed = 0;
    for listener in listeners {
        match catch_unwind(AssertUnwindSafe(|| f(&**listener))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                tracing::warn!(event, error = %e, "Listener returned error");
            }
            Err(_) => {
                failed += 1;
                tracing::warn!(event, "Listener panicked");
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl AttributeListener for Counting {
        fn on_attribute_changed(&self, _data: &serde_json::Value) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl AttributeListener for Failing {
        fn on_attribute_changed(&self, _data: &serde_json::Value) -> anyhow::Result<()> {
            anyhow::bail!("listener exploded")
        }
    }

    struct Panicking;

    impl AttributeListener for Panicking {
        fn on_attribute_changed(&self, _data: &serde_json::Value) -> anyhow::Result<()> {
            panic!("listener panicked")
        }
    }

    fn deliver(set: &ListenerSet<dyn AttributeListener>) -> usize {
        let data = serde_json::json!({"value": 1});
        set.notify("attributeChanged", |l| l.on_attribute_changed(&data))
    }

    #[test]
    fn add_and_remove_by_identity() {
        let set: ListenerSet<dyn AttributeListener> = ListenerSet::new();
        let a: Arc<dyn AttributeListener> = Arc::new(Counting(AtomicUsize::new(0)));
        let b: Arc<dyn AttributeListener> = Arc::new(Counting(AtomicUsize::new(0)));

        set.add(Arc::clone(&a));
        set.add(Arc::clone(&a));
        set.add(Arc::clone(&b));
        assert_eq!(set.len(), 2);

        assert!(set.remove(&a));
        assert!(!set.remove(&a));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn failing_listener_does_not_block_others() {
        let set: ListenerSet<dyn AttributeListener> = ListenerSet::new();
        let counter = Arc::new(Counting(AtomicUsize::new(0)));

        set.add(Arc::new(Failing));
        set.add(Arc::new(Panicking));
        set.add(counter.clone());

        assert_eq!(deliver(&set), 2);
        assert_eq!(deliver(&set), 2);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn closures_are_listeners() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let set: ListenerSet<dyn AttributeListener> = ListenerSet::new();
        set.add(Arc::new(move |data: &serde_json::Value| {
            sink.lock().unwrap().push(data.clone());
            Ok::<(), anyhow::Error>(())
        }));

        deliver(&set);
        assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!({"value": 1})]);
    }

    #[test]
    fn listener_may_unregister_during_notify() {
        struct SelfRemoving {
            set: Arc<ListenerSet<dyn AttributeListener>>,
            me: Mutex<Option<Arc<dyn AttributeListener>>>,
        }

        impl AttributeListener for SelfRemoving {
            fn on_attribute_changed(&self, _data: &serde_json::Value) -> anyhow::Result<()> {
                if let Some(me) = self.me.lock().unwrap().take() {
                    self.set.remove(&me);
                }
                Ok(())
            }
        }

        let set: Arc<ListenerSet<dyn AttributeListener>> = Arc::new(ListenerSet::new());
        let listener = Arc::new(SelfRemoving {
            set: Arc::clone(&set),
            me: Mutex::new(None),
        });
        let as_dyn: Arc<dyn AttributeListener> = listener.clone();
        *listener.me.lock().unwrap() = Some(Arc::clone(&as_dyn));
        set.add(as_dyn);

        assert_eq!(deliver(&set), 0);
        assert!(set.is_empty());
    }
}
