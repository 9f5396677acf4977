//! Reactive configuration store
//!
//! Canonical runtime state of the wizard plus its publish/subscribe registry.
//! Keys are a closed enum and values a typed variant record, so every store
//! access is exhaustiveness-checked instead of being stringly keyed.
//!
//! # Design Principles
//!
//! - **Single Source of Truth**: pages, the navigation machine and the
//!   installation pipeline all communicate through this store.
//! - **Equality-Gated Notification**: `set` with an unchanged value is a
//!   no-op; subscribers observe each distinct value exactly once.
//! - **Explicit Subscription Handles**: `subscribe` returns a
//!   [`SubscriptionId`]; callers tear down either per handle or per
//!   [`OwnerId`] when a whole page is discarded.
//! - **Never Crash a Running Installation**: developer errors (setting a key
//!   before initialization, unsubscribing an unknown handle) are logged with
//!   a backtrace and otherwise ignored.
//!
//! Notification fan-out runs synchronously on whichever thread called `set`.
//! The callback list is snapshotted under the registry lock and invoked after
//! every store lock has been released, so callbacks may freely read the store
//! but must not block waiting for another `set` on the same thread.

use crate::pages::Page;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use strum::Display;
use tracing::{error, warn};

/// A runtime configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Key {
    InternetConnection,
    UseEncryption,
    EncryptionPin,
    DesktopChosen,
    Locale,
    KeyboardLayout,
    DevicePath,
    DeviceIsPartition,
    DeviceEfiPartition,
    UserName,
    UserUsername,
    UserAutologin,
    UserPassword,
    Formats,
    Timezone,
    SoftwareChoices,
    FeatureChoices,
    InstallationRunning,
    SendNotification,
    DisplayedPage,
    Version,
}

/// A one-shot navigation request carried through the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    /// Advance past `from`. `None` skips the stale-caller guard (used by the
    /// pipeline, which owns no page).
    Next(Option<Page>),
    /// Load a named page as a detour.
    Show(Page),
}

/// A typed store value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
    /// A (code, display name) selection, e.g. keyboard layout or formats.
    Pair(String, String),
    Request(PageRequest),
    None,
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pair(&self) -> Option<(&str, &str)> {
        match self {
            Value::Pair(a, b) => Some((a, b)),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Handle to a single subscription, returned by [`Store::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Identity owning a group of subscriptions (typically one wizard page).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

/// Whether `subscribe` invokes the callback with the current value right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Immediate,
    Deferred,
}

type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    owner: OwnerId,
    callback: Callback,
}

pub struct Store {
    values: Mutex<HashMap<Key, Value>>,
    subscriptions: Mutex<HashMap<Key, Vec<Subscription>>>,
    initialized: AtomicBool,
    next_owner: AtomicU64,
    next_subscription: AtomicU64,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Create a store populated with the runtime-namespace defaults.
    pub fn new() -> Self {
        let mut values = HashMap::new();
        values.insert(Key::InternetConnection, Value::Bool(false));
        values.insert(Key::UseEncryption, Value::Bool(false));
        values.insert(Key::EncryptionPin, Value::Str(String::new()));
        values.insert(Key::DesktopChosen, Value::Pair(String::new(), String::new()));
        values.insert(Key::UserName, Value::Str(String::new()));
        values.insert(Key::UserUsername, Value::Str(String::new()));
        values.insert(Key::UserAutologin, Value::Bool(false));
        values.insert(Key::UserPassword, Value::Str(String::new()));
        values.insert(
            Key::Formats,
            Value::Pair("en_US.UTF-8".into(), "United States".into()),
        );
        values.insert(Key::Timezone, Value::Str("UTC".into()));
        values.insert(Key::SoftwareChoices, Value::List(Vec::new()));
        values.insert(Key::FeatureChoices, Value::List(Vec::new()));
        values.insert(Key::InstallationRunning, Value::Bool(false));
        values.insert(Key::SendNotification, Value::None);
        values.insert(Key::Version, Value::Int(-1));

        Self {
            values: Mutex::new(values),
            subscriptions: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            next_owner: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Fallback for keys a page may read before anything has set them.
    fn fallback(key: Key) -> Option<Value> {
        match key {
            Key::KeyboardLayout => Some(Value::Pair("us".into(), "English (US)".into())),
            Key::DeviceIsPartition => Some(Value::Bool(false)),
            Key::DeviceEfiPartition => Some(Value::Str("/dev/null".into())),
            _ => None,
        }
    }

    /// Mark the config-load phase as finished. Sets before this point on keys
    /// without a fallback are logged as developer errors.
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Allocate an owner identity for a group of subscriptions.
    pub fn new_owner(&self) -> OwnerId {
        OwnerId(self.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    /// Current value for `key`, consulting the fallback table when unset.
    /// An unknown key without fallback logs and returns [`Value::None`].
    pub fn get(&self, key: Key) -> Value {
        if let Some(value) = self.values.lock().expect("store values lock").get(&key) {
            return value.clone();
        }
        if let Some(fallback) = Self::fallback(key) {
            warn!("Using fallback value for {key}");
            return fallback;
        }
        warn!("Requested {key} not in store");
        Value::None
    }

    /// Current value for `key` without fallback resolution or logging.
    pub fn get_opt(&self, key: Key) -> Option<Value> {
        self.values.lock().expect("store values lock").get(&key).cloned()
    }

    pub fn has(&self, key: Key) -> bool {
        self.values.lock().expect("store values lock").contains_key(&key)
    }

    /// Store `value` under `key`. Returns whether the stored value changed;
    /// subscribers are notified synchronously only on change.
    pub fn set(&self, key: Key, value: Value) -> bool {
        {
            let mut values = self.values.lock().expect("store values lock");
            if values.get(&key) == Some(&value) {
                return false;
            }
            if !self.initialized.load(Ordering::Acquire) && Self::fallback(key).is_none() {
                error!(
                    "Internal error: setting {key} before config was read\n{}",
                    Backtrace::force_capture()
                );
            }
            values.insert(key, value.clone());
        }
        self.notify(key, &value);
        true
    }

    /// Atomic get-and-remove, for one-shot signals like `displayed-page`.
    pub fn steal(&self, key: Key) -> Option<Value> {
        self.values.lock().expect("store values lock").remove(&key)
    }

    /// Re-notify subscribers of `key` with the current value.
    pub fn bump(&self, key: Key) {
        let value = self.get(key);
        self.notify(key, &value);
    }

    /// Convenience: request an advance past `from` via `displayed-page`.
    pub fn request_advance(&self, from: Option<Page>) {
        self.set(Key::DisplayedPage, Value::Request(PageRequest::Next(from)));
    }

    /// Convenience: request a detour to `page` via `displayed-page`.
    pub fn request_page(&self, page: Page) {
        self.set(Key::DisplayedPage, Value::Request(PageRequest::Show(page)));
    }

    /// Register `callback` for changes of `key` under `owner`.
    ///
    /// With [`Dispatch::Immediate`] the callback is invoked with the current
    /// value before this returns, provided the key holds one.
    pub fn subscribe<F>(&self, key: Key, owner: OwnerId, dispatch: Dispatch, callback: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let callback: Callback = Arc::new(callback);
        {
            let mut subs = self.subscriptions.lock().expect("store subscription lock");
            subs.entry(key).or_default().push(Subscription {
                id,
                owner,
                callback: Arc::clone(&callback),
            });
        }

        if dispatch == Dispatch::Immediate {
            if let Some(value) = self.get_opt(key) {
                callback(&value);
            } else if Self::fallback(key).is_none() {
                error!(
                    "Internal error: subscribing to unset {key}\n{}",
                    Backtrace::force_capture()
                );
            }
        }
        id
    }

    /// Remove one subscription. Unknown handles are a developer error.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subscriptions.lock().expect("store subscription lock");
        for list in subs.values_mut() {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                list.remove(pos);
                return;
            }
        }
        error!(
            "Internal error: unsubscribing unknown subscription {id:?}\n{}",
            Backtrace::force_capture()
        );
    }

    /// Remove every subscription registered under `owner`.
    pub fn unsubscribe_owner(&self, owner: OwnerId) {
        let mut subs = self.subscriptions.lock().expect("store subscription lock");
        for list in subs.values_mut() {
            list.retain(|s| s.owner != owner);
        }
    }

    fn notify(&self, key: Key, value: &Value) {
        let callbacks: Vec<Callback> = {
            let subs = self.subscriptions.lock().expect("store subscription lock");
            subs.get(&key)
                .map(|list| list.iter().map(|s| Arc::clone(&s.callback)).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_store() -> (Arc<Store>, Arc<AtomicUsize>, OwnerId) {
        let store = Arc::new(Store::new());
        store.mark_initialized();
        let counter = Arc::new(AtomicUsize::new(0));
        let owner = store.new_owner();
        (store, counter, owner)
    }

    #[test]
    fn test_set_same_value_notifies_once() {
        let (store, counter, owner) = counting_store();
        let c = Arc::clone(&counter);
        store.subscribe(Key::Timezone, owner, Dispatch::Deferred, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(store.set(Key::Timezone, Value::Str("Europe/Berlin".into())));
        assert!(!store.set(Key::Timezone, Value::Str("Europe/Berlin".into())));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_immediate_dispatch_sees_current_value() {
        let (store, counter, owner) = counting_store();
        store.set(Key::UserName, Value::Str("alice".into()));

        let c = Arc::clone(&counter);
        store.subscribe(Key::UserName, owner, Dispatch::Immediate, move |v| {
            assert_eq!(v.as_str(), Some("alice"));
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deferred_dispatch_waits_for_change() {
        let (store, counter, owner) = counting_store();
        let c = Arc::clone(&counter);
        store.subscribe(Key::UserName, owner, Dispatch::Deferred, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        store.set(Key::UserName, Value::Str("bob".into()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_by_handle() {
        let (store, counter, owner) = counting_store();
        let c = Arc::clone(&counter);
        let id = store.subscribe(Key::Timezone, owner, Dispatch::Deferred, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        store.unsubscribe(id);
        store.set(Key::Timezone, Value::Str("UTC+1".into()));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_owner_removes_all_of_owner_only() {
        let (store, counter, owner) = counting_store();
        let other_owner = store.new_owner();

        let c1 = Arc::clone(&counter);
        store.subscribe(Key::Timezone, owner, Dispatch::Deferred, move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&counter);
        store.subscribe(Key::UserName, owner, Dispatch::Deferred, move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        let c3 = Arc::clone(&counter);
        store.subscribe(Key::Timezone, other_owner, Dispatch::Deferred, move |_| {
            c3.fetch_add(10, Ordering::SeqCst);
        });

        store.unsubscribe_owner(owner);
        store.set(Key::Timezone, Value::Str("UTC+2".into()));
        store.set(Key::UserName, Value::Str("carol".into()));
        // only the surviving subscription fired
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_steal_removes_value() {
        let (store, _, _) = counting_store();
        store.set(Key::DisplayedPage, Value::Request(PageRequest::Next(None)));
        assert_eq!(
            store.steal(Key::DisplayedPage),
            Some(Value::Request(PageRequest::Next(None)))
        );
        assert_eq!(store.steal(Key::DisplayedPage), None);
        assert!(!store.has(Key::DisplayedPage));
    }

    #[test]
    fn test_fallback_values() {
        let store = Store::new();
        assert_eq!(
            store.get(Key::KeyboardLayout),
            Value::Pair("us".into(), "English (US)".into())
        );
        assert_eq!(store.get(Key::DeviceEfiPartition), Value::Str("/dev/null".into()));
        // no fallback registered, not an initialized key
        assert_eq!(store.get(Key::Locale), Value::None);
    }

    #[test]
    fn test_bump_renotifies_without_change() {
        let (store, counter, owner) = counting_store();
        let c = Arc::clone(&counter);
        store.subscribe(Key::Timezone, owner, Dispatch::Deferred, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        store.bump(Key::Timezone);
        store.bump(Key::Timezone);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_notification_order_is_registration_order() {
        let (store, _, owner) = counting_store();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let order = Arc::clone(&order);
            store.subscribe(Key::Timezone, owner, Dispatch::Deferred, move |_| {
                order.lock().unwrap().push(tag);
            });
        }
        store.set(Key::Timezone, Value::Str("Asia/Tokyo".into()));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_set_from_background_thread_notifies_synchronously() {
        let (store, counter, owner) = counting_store();
        let c = Arc::clone(&counter);
        store.subscribe(Key::InternetConnection, owner, Dispatch::Deferred, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let background = Arc::clone(&store);
        std::thread::spawn(move || {
            background.set(Key::InternetConnection, Value::Bool(true));
        })
        .join()
        .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(Key::InternetConnection), Value::Bool(true));
    }
}
