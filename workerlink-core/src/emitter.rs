use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use indexmap::IndexMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use crate::RpcError;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent<T> {
    Next(T),
    Error(RpcError),
    Complete,
}

impl<T> StreamEvent<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Next(_))
    }
}

type ObserverFn<T> = Arc<dyn Fn(&StreamEvent<T>) + Send + Sync>;

#[derive(Debug, Clone)]
enum Terminal {
    Error(RpcError),
    Complete,
}

impl Terminal {
    fn to_event<T>(&self) -> StreamEvent<T> {
        match self {
            Terminal::Error(err) => StreamEvent::Error(err.clone()),
            Terminal::Complete => StreamEvent::Complete,
        }
    }
}

struct Entry<T> {
    observer: ObserverFn<T>,
    closed: Arc<AtomicBool>,
}

struct State<T> {
    observers: IndexMap<u64, Entry<T>>,
    next_id: u64,
    terminal: Option<Terminal>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn detach(&self, id: u64) {
        self.lock().observers.shift_remove(&id);
    }
}

/// A hot, multicast source of values.
///
/// Observers are called synchronously, in subscription order, from whichever
/// thread emits. After an error or completion the emitter is stopped: further
/// emissions are dropped and late subscribers immediately receive the terminal
/// event.
pub struct Emitter<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Emitter {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Emitter")
            .field("observers", &state.observers.len())
            .field("stopped", &state.terminal.is_some())
            .finish()
    }
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Emitter<T> {
    pub fn new() -> Self {
        Emitter {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    observers: IndexMap::new(),
                    next_id: 1,
                    terminal: None,
                }),
            }),
        }
    }

    pub fn next(&self, value: T) {
        self.emit(StreamEvent::Next(value));
    }

    pub fn error(&self, error: RpcError) {
        self.emit(StreamEvent::Error(error));
    }

    pub fn complete(&self) {
        self.emit(StreamEvent::Complete);
    }

    pub fn emit(&self, event: StreamEvent<T>) {
        let observers: Vec<ObserverFn<T>> = {
            let mut state = self.inner.lock();
            if state.terminal.is_some() {
                return;
            }
            let observers = state
                .observers
                .values()
                .map(|entry| Arc::clone(&entry.observer))
                .collect();
            match &event {
                StreamEvent::Next(_) => {}
                StreamEvent::Error(err) => state.terminal = Some(Terminal::Error(err.clone())),
                StreamEvent::Complete => state.terminal = Some(Terminal::Complete),
            }
            if event.is_terminal() {
                for (_, entry) in state.observers.drain(..) {
                    entry.closed.store(true, Ordering::Release);
                }
            }
            observers
        };

        for observer in observers {
            observer(&event);
        }
    }

    /// Attaches a raw event callback.
    pub fn observe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&StreamEvent<T>) + Send + Sync + 'static,
        T: 'static,
    {
        let observer: ObserverFn<T> = Arc::new(observer);
        let mut state = self.inner.lock();
        if let Some(terminal) = state.terminal.clone() {
            drop(state);
            observer(&terminal.to_event());
            return Subscription::closed();
        }

        let id = state.next_id;
        state.next_id += 1;
        let closed = Arc::new(AtomicBool::new(false));
        state.observers.insert(
            id,
            Entry {
                observer,
                closed: Arc::clone(&closed),
            },
        );
        drop(state);

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(closed, move || {
            if let Some(inner) = weak.upgrade() {
                inner.detach(id);
            }
        })
    }

    pub fn subscribe(&self, observer: Observer<T>) -> Subscription
    where
        T: Clone + 'static,
    {
        self.observe(move |event| observer.notify(event.clone()))
    }

    /// A read-only view that can be handed out without exposing `next`.
    pub fn as_observable(&self) -> Observable<T> {
        Observable {
            emitter: self.clone(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().terminal.is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }
}

/// Read-only side of an [`Emitter`].
pub struct Observable<T> {
    emitter: Emitter<T>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Observable {
            emitter: self.emitter.clone(),
        }
    }
}

impl<T> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Observable").field(&self.emitter).finish()
    }
}

impl<T: Clone + Send + 'static> Observable<T> {
    pub fn subscribe(&self, observer: Observer<T>) -> Subscription {
        self.emitter.subscribe(observer)
    }

    pub fn observe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&StreamEvent<T>) + Send + Sync + 'static,
    {
        self.emitter.observe(observer)
    }

    /// Adapts the view into a `Stream` that ends on completion and yields one
    /// `Err` before ending on error. Dropping the stream detaches it.
    pub fn stream(&self) -> EventStream<T> {
        let (tx, rx) = mpsc::unbounded();
        let subscription = self.emitter.observe(move |event| match event {
            StreamEvent::Next(value) => {
                let _ = tx.unbounded_send(Ok(value.clone()));
            }
            StreamEvent::Error(err) => {
                let _ = tx.unbounded_send(Err(err.clone()));
                tx.close_channel();
            }
            StreamEvent::Complete => tx.close_channel(),
        });
        EventStream { rx, subscription }
    }
}

pub struct EventStream<T> {
    rx: mpsc::UnboundedReceiver<Result<T, RpcError>>,
    subscription: Subscription,
}

impl<T> fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("subscription", &self.subscription)
            .finish()
    }
}

impl<T> Stream for EventStream<T> {
    type Item = Result<T, RpcError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

type Teardown = Box<dyn FnOnce() + Send>;

/// Handle returned by every subscribe call. Dropping it does not detach.
pub struct Subscription {
    closed: Arc<AtomicBool>,
    teardown: Mutex<Option<Teardown>>,
}

impl Subscription {
    fn new(closed: Arc<AtomicBool>, teardown: impl FnOnce() + Send + 'static) -> Self {
        Subscription {
            closed,
            teardown: Mutex::new(Some(Box::new(teardown))),
        }
    }

    fn closed() -> Self {
        Subscription {
            closed: Arc::new(AtomicBool::new(true)),
            teardown: Mutex::new(None),
        }
    }

    pub fn unsubscribe(&self) {
        self.closed.store(true, Ordering::Release);
        let teardown = self
            .teardown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

type NextFn<T> = Box<dyn Fn(T) + Send + Sync>;
type ErrorFn = Box<dyn Fn(RpcError) + Send + Sync>;
type CompleteFn = Box<dyn Fn() + Send + Sync>;

/// Three optional callbacks, one per event kind.
pub struct Observer<T> {
    next: Option<NextFn<T>>,
    error: Option<ErrorFn>,
    complete: Option<CompleteFn>,
}

impl<T> Observer<T> {
    pub fn new(next: impl Fn(T) + Send + Sync + 'static) -> Self {
        Observer {
            next: Some(Box::new(next)),
            error: None,
            complete: None,
        }
    }

    pub fn empty() -> Self {
        Observer {
            next: None,
            error: None,
            complete: None,
        }
    }

    pub fn on_error(mut self, error: impl Fn(RpcError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(error));
        self
    }

    pub fn on_complete(mut self, complete: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Some(Box::new(complete));
        self
    }

    pub fn has_callbacks(&self) -> bool {
        self.next.is_some() || self.error.is_some() || self.complete.is_some()
    }

    pub fn notify(&self, event: StreamEvent<T>) {
        match event {
            StreamEvent::Next(value) => {
                if let Some(next) = &self.next {
                    next(value);
                }
            }
            StreamEvent::Error(err) => {
                if let Some(error) = &self.error {
                    error(err);
                }
            }
            StreamEvent::Complete => {
                if let Some(complete) = &self.complete {
                    complete();
                }
            }
        }
    }
}

impl<T> fmt::Debug for Observer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("next", &self.next.is_some())
            .field("error", &self.error.is_some())
            .field("complete", &self.complete.is_some())
            .finish()
    }
}
