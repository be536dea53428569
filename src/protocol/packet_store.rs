//! Bounded, append-only log of decoded frames with synchronous subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use log::trace;

use super::decoder::DecodedFrame;

pub const DEFAULT_CAPACITY: usize = 1000;

type Listener = Arc<dyn Fn(&DecodedFrame) + Send + Sync>;

struct Inner {
    capacity: usize,
    frames: RwLock<VecDeque<Arc<DecodedFrame>>>,
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
}

/// Cloning yields another handle to the same log.
#[derive(Clone)]
pub struct PacketStore {
    inner: Arc<Inner>,
}

/// Handle returned by [`PacketStore::subscribe`].
pub struct Subscription {
    store: Weak<Inner>,
    id: u64,
}

impl Subscription {
    /// Deregister the listener. Safe to call from inside the listener itself.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.store.upgrade() {
            let mut listeners = inner.listeners.write().unwrap_or_else(|e| e.into_inner());
            listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Default for PacketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                capacity,
                frames: RwLock::new(VecDeque::with_capacity(capacity)),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Append a frame, evicting the oldest past capacity, then notify every
    /// listener registered at this moment in subscription order.
    pub fn add(&self, frame: DecodedFrame) -> Arc<DecodedFrame> {
        let frame = Arc::new(frame);
        {
            let mut frames = self.inner.frames.write().unwrap_or_else(|e| e.into_inner());
            frames.push_back(Arc::clone(&frame));
            while frames.len() > self.inner.capacity {
                if let Some(old) = frames.pop_front() {
                    trace!("packet log full, evicted frame #{}", old.id);
                }
            }
        }
        // Snapshot so listeners can (un)subscribe while being called.
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&frame);
        }
        frame
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&DecodedFrame) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        Subscription {
            store: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn get(&self, id: u64) -> Option<Arc<DecodedFrame>> {
        self.read().iter().find(|f| f.id == id).cloned()
    }

    /// Snapshot of the log, oldest first.
    pub fn get_all(&self) -> Vec<Arc<DecodedFrame>> {
        self.read().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<Arc<DecodedFrame>> {
        self.read().back().cloned()
    }

    /// Drop every frame. Listeners are not notified.
    pub fn clear(&self) {
        self.inner
            .frames
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, VecDeque<Arc<DecodedFrame>>> {
        self.inner.frames.read().unwrap_or_else(|e| e.into_inner())
    }
}
