//! Snapshot stores for broker-pushed state
//!
//! The broker pushes full lists of intercepts and agents on every change;
//! one [`SnapshotStore`] holds the latest list of each. Readers take
//! point-in-time copies, and a per-key waiter slot lets a caller block until
//! a named item appears in (or vanishes from) a future snapshot.
//!
//! # Waiter semantics
//!
//! - One pending slot per key: a new wait for the same key replaces the old
//!   one, whose receiver resolves as cancelled.
//! - A wait that is already satisfied by the current snapshot resolves
//!   immediately.
//! - The slot is fulfilled and removed by the first replace that satisfies
//!   it; waiting again after inspecting the delivered item is the way to
//!   follow an item across several refreshes.
//!
//! Both the list and the waiter map live under one lock, so a waiter can
//! never miss the refresh that raced with its registration.

use std::collections::HashMap;
use std::collections::HashSet;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::proto::broker::{AgentInfo, InterceptInfo};

/// Items a [`SnapshotStore`] can hold
pub trait Snapshotted: Clone + Send + 'static {
    /// Key waiters are registered against; unique within one snapshot
    fn key(&self) -> String;

    /// (name, namespace) identity used for representative dedup
    fn name_and_namespace(&self) -> (&str, &str);
}

impl Snapshotted for AgentInfo {
    fn key(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }

    fn name_and_namespace(&self) -> (&str, &str) {
        (&self.name, &self.namespace)
    }
}

impl Snapshotted for InterceptInfo {
    fn key(&self) -> String {
        self.spec
            .as_ref()
            .map(|s| s.name.clone())
            .unwrap_or_default()
    }

    fn name_and_namespace(&self) -> (&str, &str) {
        self.spec
            .as_ref()
            .map(|s| (s.name.as_str(), s.namespace.as_str()))
            .unwrap_or(("", ""))
    }
}

/// One registered waiter; which way it is watching decides what fulfills it
enum Waiter<T> {
    Appear(oneshot::Sender<T>),
    Vanish(oneshot::Sender<()>),
}

struct Inner<T> {
    items: Vec<T>,
    generation: u64,
    waiters: HashMap<String, Waiter<T>>,
}

/// Thread-safe holder for the latest broker-pushed list of one kind
///
/// The list is replaced wholesale on every refresh; readers never observe a
/// partially-updated snapshot.
pub struct SnapshotStore<T: Snapshotted> {
    name: &'static str,
    inner: Mutex<Inner<T>>,
}

/// Store for the latest agent list
pub type AgentStore = SnapshotStore<AgentInfo>;

/// Store for the latest intercept list
pub type InterceptStore = SnapshotStore<InterceptInfo>;

impl<T: Snapshotted> SnapshotStore<T> {
    /// Create an empty store; `name` tags its log lines
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                items: Vec::new(),
                generation: 0,
                waiters: HashMap::new(),
            }),
        }
    }

    /// Point-in-time copy of the current list
    pub async fn current(&self) -> Vec<T> {
        self.inner.lock().await.items.clone()
    }

    /// Number of refreshes applied so far
    pub async fn generation(&self) -> u64 {
        self.inner.lock().await.generation
    }

    /// Replace the list with a fresh snapshot and fulfill satisfied waiters
    pub async fn replace(&self, items: Vec<T>) {
        let mut inner = self.inner.lock().await;
        inner.items = items;
        inner.generation += 1;

        let Inner {
            items, waiters, ..
        } = &mut *inner;

        let pending = std::mem::take(waiters);
        for (key, waiter) in pending {
            match waiter {
                Waiter::Appear(tx) => match items.iter().find(|i| i.key() == key) {
                    Some(item) => {
                        debug!(store = self.name, key = %key, "Waiter fulfilled: appeared");
                        let _ = tx.send(item.clone());
                    }
                    None => {
                        waiters.insert(key, Waiter::Appear(tx));
                    }
                },
                Waiter::Vanish(tx) => {
                    if items.iter().any(|i| i.key() == key) {
                        waiters.insert(key, Waiter::Vanish(tx));
                    } else {
                        debug!(store = self.name, key = %key, "Waiter fulfilled: vanished");
                        let _ = tx.send(());
                    }
                }
            }
        }
    }

    /// One representative item per distinct (name, namespace), first seen wins
    ///
    /// Multiple replicas of one workload each report their own record; edit
    /// and uninstall operations need exactly one per workload.
    pub async fn representative(&self) -> Vec<T> {
        let inner = self.inner.lock().await;
        let mut seen = HashSet::new();
        inner
            .items
            .iter()
            .filter(|item| {
                let (name, namespace) = item.name_and_namespace();
                seen.insert((name.to_string(), namespace.to_string()))
            })
            .cloned()
            .collect()
    }

    /// Wait for `key` to be present in a snapshot; delivers the item
    ///
    /// Resolves immediately if the current snapshot already contains the key.
    /// Replaces any waiter previously registered for the same key.
    pub async fn wait_appear(&self, key: &str) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().await;
        if let Some(item) = inner.items.iter().find(|i| i.key() == key) {
            let _ = tx.send(item.clone());
            return rx;
        }
        debug!(store = self.name, key = %key, "Registering appear waiter");
        inner.waiters.insert(key.to_string(), Waiter::Appear(tx));
        rx
    }

    /// Wait for the next refresh that contains `key`, skipping the current one
    ///
    /// Unlike [`SnapshotStore::wait_appear`] this never resolves from the
    /// snapshot already in place; callers use it to follow an item they have
    /// already inspected across refreshes. Replaces any waiter previously
    /// registered for the same key.
    pub async fn wait_next(&self, key: &str) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().await;
        debug!(store = self.name, key = %key, "Registering next-refresh waiter");
        inner.waiters.insert(key.to_string(), Waiter::Appear(tx));
        rx
    }

    /// Wait for `key` to be absent from a snapshot
    ///
    /// Resolves immediately if the current snapshot does not contain the
    /// key. Replaces any waiter previously registered for the same key.
    pub async fn wait_vanish(&self, key: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().await;
        if !inner.items.iter().any(|i| i.key() == key) {
            let _ = tx.send(());
            return rx;
        }
        debug!(store = self.name, key = %key, "Registering vanish waiter");
        inner.waiters.insert(key.to_string(), Waiter::Vanish(tx));
        rx
    }
}
