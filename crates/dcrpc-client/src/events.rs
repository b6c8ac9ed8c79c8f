//! Fan-out of engine notifications to subscribers.
//!
//! Dispatch never blocks the reader task: channel subscribers get an unbounded
//! queue, callback listeners run inline and must stay short. A failing or
//! panicking listener is logged and skipped.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use dcrpc_core::Notification;
use futures::Stream;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

const ACCOUNT_KEYS: &[&str] = &["account_id", "accountId", "contextId"];
const CHAT_KEYS: &[&str] = &["chat_id", "chatId"];

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

pub type ListenerResult = std::result::Result<(), ListenerError>;

type Callback = Box<dyn Fn(&Notification) -> ListenerResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Selects which notifications a listener sees. The default matches everything.
///
/// Account and chat ids are looked up by key in object params (top level or one
/// nested object), or by position in array params (`[account_id, chat_id, ..]`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    methods: Option<Vec<String>>,
    account_id: Option<u64>,
    chat_id: Option<u64>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to a method name. May be called repeatedly.
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.methods.get_or_insert_with(Vec::new).push(method.into());
        self
    }

    pub fn account(mut self, account_id: u64) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn chat(mut self, chat_id: u64) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    pub fn matches(&self, notification: &Notification) -> bool {
        if let Some(ref methods) = self.methods {
            if !methods.iter().any(|m| *m == notification.method) {
                return false;
            }
        }

        if let Some(account_id) = self.account_id {
            if lookup_id(&notification.params, ACCOUNT_KEYS, 0) != Some(account_id) {
                return false;
            }
        }

        if let Some(chat_id) = self.chat_id {
            if lookup_id(&notification.params, CHAT_KEYS, 1) != Some(chat_id) {
                return false;
            }
        }

        true
    }
}

fn lookup_id(params: &Value, keys: &[&str], position: usize) -> Option<u64> {
    match params {
        Value::Array(items) => items.get(position).and_then(Value::as_u64),
        Value::Object(map) => find_key(map, keys).or_else(|| {
            map.values()
                .filter_map(Value::as_object)
                .find_map(|nested| find_key(nested, keys))
        }),
        _ => None,
    }
}

fn find_key(map: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter()
        .find_map(|key| map.get(*key).and_then(Value::as_u64))
}

enum Sink {
    Channel(mpsc::UnboundedSender<Notification>),
    Callback(Callback),
}

struct Listener {
    id: SubscriptionId,
    filter: EventFilter,
    sink: Sink,
}

/// Stream of notifications for one subscription. Ends when the connection closes.
pub struct EventStream {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl EventStream {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Notification>> {
        self.rx.poll_recv(cx)
    }
}

pub struct EventDispatcher {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Arc<Listener>>>,
    closed: AtomicBool,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Arc<Listener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, filter: EventFilter, sink: Sink) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        // Checked under the lock so a concurrent close cannot miss this listener.
        let mut listeners = self.listeners();
        if self.closed.load(Ordering::SeqCst) {
            // Dropping the sink ends a channel subscriber right away.
            return id;
        }
        listeners.push(Arc::new(Listener { id, filter, sink }));
        id
    }

    /// Subscribe with a channel. Dropping the stream unsubscribes it.
    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(filter, Sink::Channel(tx));
        EventStream { id, rx }
    }

    /// Subscribe with a callback run on the reader task.
    pub fn add_listener<F>(&self, filter: EventFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) -> ListenerResult + Send + Sync + 'static,
    {
        self.register(filter, Sink::Callback(Box::new(callback)))
    }

    /// Returns whether a listener was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    /// Delivers to every matching listener in subscription order.
    pub fn dispatch(&self, notification: &Notification) {
        let snapshot: Vec<Arc<Listener>> = self.listeners().clone();
        let mut gone = Vec::new();

        for listener in snapshot.iter().filter(|l| l.filter.matches(notification)) {
            match &listener.sink {
                Sink::Channel(tx) => {
                    if tx.send(notification.clone()).is_err() {
                        gone.push(listener.id);
                    }
                }
                Sink::Callback(callback) => {
                    match catch_unwind(AssertUnwindSafe(|| callback(notification))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!(
                            "Event listener {:?} failed on {}: {}",
                            listener.id,
                            notification.method,
                            e
                        ),
                        Err(_) => tracing::error!(
                            "Event listener {:?} panicked on {}",
                            listener.id,
                            notification.method
                        ),
                    }
                }
            }
        }

        if !gone.is_empty() {
            tracing::debug!("Dropping {} closed event subscriptions", gone.len());
            self.listeners().retain(|l| !gone.contains(&l.id));
        }
    }

    /// Drops every listener; open streams end.
    pub fn close(&self) {
        let mut listeners = self.listeners();
        self.closed.store(true, Ordering::SeqCst);
        listeners.clear();
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
