use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use workerlink_core::{
    generate_key, key_space_exhausted, Emitter, EventStream, Observable, Observer, RpcError, StreamEvent, StreamMessage,
    StreamMessageKind, Subscription, SubscriptionKey, MAX_KEY_ATTEMPTS,
};

type Sink = Arc<dyn Fn(StreamMessage) + Send + Sync>;

struct StreamEntry {
    member: String,
    local_id: u64,
    sink: Sink,
}

/// Key and local identity of a freshly registered subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub key: SubscriptionKey,
    pub local_id: u64,
}

/// Live remote subscriptions of one client, keyed by subscription key.
pub struct StreamTable {
    entries: DashMap<SubscriptionKey, StreamEntry>,
    next_id: AtomicU64,
    key_length: usize,
}

impl fmt::Debug for StreamTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTable")
            .field("entries", &self.entries.len())
            .field("key_length", &self.key_length)
            .finish()
    }
}

impl StreamTable {
    pub fn new(key_length: usize) -> Self {
        StreamTable {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
            key_length,
        }
    }

    /// Reserves a fresh key for `member` and routes its messages to `emitter`.
    ///
    /// Fails when no free key turns up within `MAX_KEY_ATTEMPTS` draws.
    pub fn register<V>(&self, member: &str, emitter: Emitter<V>) -> Result<Registration, RpcError>
    where
        V: DeserializeOwned + Send + 'static,
    {
        let local_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sink = sink_for(emitter);
        for _ in 0..MAX_KEY_ATTEMPTS {
            let key = SubscriptionKey::new(generate_key(member, self.key_length));
            match self.entries.entry(key.clone()) {
                Entry::Occupied(_) => {
                    trace!(key = %key, "subscription key collided, retrying");
                }
                Entry::Vacant(slot) => {
                    slot.insert(StreamEntry {
                        member: member.to_string(),
                        local_id,
                        sink,
                    });
                    debug!(key = %key, member = %member, "remote subscription registered");
                    return Ok(Registration { key, local_id });
                }
            }
        }
        Err(key_space_exhausted(member, self.key_length))
    }

    /// Routes one stream message. Terminal messages retire the entry.
    pub fn dispatch(&self, message: StreamMessage) -> bool {
        let sink = match self.entries.get(&message.key) {
            Some(entry) => Arc::clone(&entry.sink),
            None => {
                trace!(key = %message.key, "stream message for unknown key ignored");
                return false;
            }
        };
        if message.kind != StreamMessageKind::Next {
            self.entries.remove(&message.key);
            debug!(key = %message.key, kind = ?message.kind, "remote stream ended");
        }
        sink(message);
        true
    }

    /// The member name behind a handle, if it is still live.
    pub fn member(&self, key: &SubscriptionKey, local_id: u64) -> Option<String> {
        self.entries
            .get(key)
            .filter(|entry| entry.local_id == local_id)
            .map(|entry| entry.member.clone())
    }

    /// Removes the entry only if it still belongs to the same handle.
    pub fn remove(&self, key: &SubscriptionKey, local_id: u64) -> Option<String> {
        self.entries
            .remove_if(key, |_, entry| entry.local_id == local_id)
            .map(|(_, entry)| entry.member)
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

fn sink_for<V>(emitter: Emitter<V>) -> Sink
where
    V: DeserializeOwned + Send + 'static,
{
    Arc::new(move |message: StreamMessage| match message.kind {
        StreamMessageKind::Next => {
            match serde_json::from_value::<V>(message.value.unwrap_or(Value::Null)) {
                Ok(value) => emitter.next(value),
                Err(e) => emitter.error(RpcError::bad_request(format!(
                    "stream value could not be decoded: {e}"
                ))),
            }
        }
        StreamMessageKind::Error => emitter.error(match message.error {
            Some(payload) => RpcError::from_payload(payload),
            None => RpcError::dispatch("remote stream failed without an error"),
        }),
        StreamMessageKind::Complete => emitter.complete(),
    })
}

/// Anything `WorkerClient::unsubscribe` accepts.
pub trait StreamHandle {
    fn key(&self) -> &SubscriptionKey;

    fn local_id(&self) -> u64;

    /// Detaches whatever local observer the handle owns.
    fn release(&self) {}
}

/// Returned by `WorkerClient::subscribe`.
#[derive(Debug)]
pub struct RemoteSubscription {
    key: SubscriptionKey,
    local_id: u64,
    local: Subscription,
}

impl RemoteSubscription {
    pub(crate) fn new(registration: Registration, local: Subscription) -> Self {
        RemoteSubscription {
            key: registration.key,
            local_id: registration.local_id,
            local,
        }
    }

    /// True once the observer stopped receiving events.
    pub fn is_closed(&self) -> bool {
        self.local.is_closed()
    }
}

impl StreamHandle for RemoteSubscription {
    fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    fn local_id(&self) -> u64 {
        self.local_id
    }

    fn release(&self) {
        self.local.unsubscribe();
    }
}

/// Returned by `WorkerClient::observe`: a local view of a remote stream.
pub struct RemoteObservable<V> {
    key: SubscriptionKey,
    local_id: u64,
    observable: Observable<V>,
}

impl<V> fmt::Debug for RemoteObservable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObservable")
            .field("key", &self.key)
            .field("local_id", &self.local_id)
            .finish()
    }
}

impl<V> RemoteObservable<V> {
    pub(crate) fn new(registration: Registration, observable: Observable<V>) -> Self {
        RemoteObservable {
            key: registration.key,
            local_id: registration.local_id,
            observable,
        }
    }

    pub fn observable(&self) -> &Observable<V> {
        &self.observable
    }
}

impl<V: Clone + Send + 'static> RemoteObservable<V> {
    pub fn subscribe(&self, observer: Observer<V>) -> Subscription {
        self.observable.subscribe(observer)
    }

    pub fn observe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&StreamEvent<V>) + Send + Sync + 'static,
    {
        self.observable.observe(observer)
    }

    /// Values as a `Stream`, ending on completion or after the first error.
    pub fn stream(&self) -> EventStream<V> {
        self.observable.stream()
    }
}

impl<V> StreamHandle for RemoteObservable<V> {
    fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    fn local_id(&self) -> u64 {
        self.local_id
    }
}
