//! [`Observable`] – a value cell with a publish channel.
//!
//! Every call to [`Observable::set`] stores the value and broadcasts it, even
//! when it equals the previous value.  An optimistic write followed by a
//! rollback therefore produces two emissions that subscribers can observe.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 64;

/// Shared, observable value.  Clones share the same cell and channel.
///
/// # Example
///
/// ```
/// use aegis_middleware::Observable;
///
/// let state = Observable::new(0u32);
/// let mut rx = state.subscribe();
/// state.set(1);
/// state.set(1);
/// assert_eq!(rx.try_recv().unwrap(), 1);
/// assert_eq!(rx.try_recv().unwrap(), 1);
/// assert_eq!(state.get(), 1);
/// ```
#[derive(Debug)]
pub struct Observable<T> {
    current: Arc<RwLock<T>>,
    sender: broadcast::Sender<T>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
            sender: self.sender.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    pub fn new(initial: T) -> Self {
        Self::with_capacity(initial, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(initial: T, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            current: Arc::new(RwLock::new(initial)),
            sender,
        }
    }

    /// A copy of the current value.
    pub fn get(&self) -> T {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store `value` and emit it.  Returns the number of subscribers that
    /// were handed the value.
    pub fn set(&self, value: T) -> usize {
        {
            let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
            *guard = value.clone();
        }
        // No subscribers is a normal condition.
        self.sender.send(value).unwrap_or(0)
    }

    /// Replace the value with `f(current)`, emit it and return it.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> T {
        let next = {
            let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let next = f(&guard);
            *guard = next.clone();
            next
        };
        let _ = self.sender.send(next.clone());
        next
    }

    /// Receive every value written from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }
}
