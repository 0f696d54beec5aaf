// End-to-end: a client driving a worker over the in-app loopback and over a
// dedicated worker thread.

use futures::StreamExt;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use workerlink_client::{
    create_test_client, ClientConfig, InAppWorker, RequestOptions, TokenSource, WorkerClient,
    WorkerDefinition, WorkerManager,
};
use workerlink_core::{
    AccessOptions, Accessible, CallOptions, CapabilityToken, Declaration, Deferred, Emitter,
    ErrorCode, Gate, Gated, MemberKind, Observer, Remote, RpcError, Streamable, TokenPayload,
    Transferable, TypeTag,
};
use workerlink_transport::{MessageBus, MessageHandler, TransportError};
use workerlink_worker::{init_test_logging, WorkerConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Calibration {
    offset: f64,
    #[serde(skip)]
    revived: bool,
}

impl Transferable for Calibration {
    fn revive(plain: Value) -> Result<Self, RpcError> {
        let mut calibration: Calibration = serde_json::from_value(plain)?;
        calibration.revived = true;
        Ok(calibration)
    }
}

#[derive(Debug)]
struct Sensor {
    gate: Gate,
    label: Accessible<String>,
    serial: Accessible<String>,
    pin: Accessible<u32>,
    calibration: Accessible<Calibration>,
    samples: Streamable<i64>,
    initialized: AtomicBool,
}

impl Sensor {
    fn label(&self) -> Gated<String> {
        self.gate.access("label", &self.label)
    }

    fn serial(&self) -> Gated<String> {
        self.gate.access("serial", &self.serial)
    }

    fn pin(&self) -> Gated<u32> {
        self.gate.access("pin", &self.pin)
    }

    fn calibration(&self) -> Gated<Calibration> {
        self.gate.access("calibration", &self.calibration)
    }

    fn samples(&self) -> Gated<Emitter<i64>> {
        self.gate.stream("samples", &self.samples)
    }

    fn add(&self, a: i64, b: i64) -> Gated<i64> {
        self.gate.call("add", (a, b), |(a, b)| a + b)
    }

    fn emit(&self, value: i64) -> Gated<()> {
        self.gate.call("emit", (value,), |(value,)| self.samples.emitter().next(value))
    }

    fn halt(&self) -> Gated<()> {
        self.gate.call("halt", (), |_| {
            self.samples.emitter().error(RpcError::internal("sensor offline"))
        })
    }

    fn fail(&self) -> Gated<()> {
        self.gate.call("fail", (), |_| ())
    }

    fn is_revived(&self, calibration: Calibration) -> Gated<bool> {
        self.gate.call("isRevived", (calibration,), |(c,)| c.revived)
    }

    fn current(&self) -> Gated<Calibration> {
        self.gate.call("current", (), |_| self.calibration.get())
    }

    fn store(&self, entries: BTreeMap<(u8, u8), u8>) -> Gated<usize> {
        self.gate.call("store", (entries,), |(entries,)| entries.len())
    }

    fn wait(&self, millis: u64) -> Gated<Deferred<u64>> {
        self.gate.call_async("wait", (millis,), |(millis,)| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(millis)
        })
    }

    fn snapshot(&self) -> Gated<Deferred<Calibration>> {
        let current = self.calibration.get();
        self.gate.call_async("snapshot", (), |_| async move { Ok(current) })
    }
}

impl Remote for Sensor {
    fn construct() -> Self {
        Sensor {
            gate: Gate::new::<Sensor>(),
            label: Accessible::new("probe".to_string()),
            serial: Accessible::new("SN-7".to_string()),
            pin: Accessible::new(4321),
            calibration: Accessible::new(Calibration::default()),
            samples: Streamable::new(),
            initialized: AtomicBool::new(false),
        }
    }

    fn gate(&self) -> &Gate {
        &self.gate
    }

    fn declare(decl: &mut Declaration<Self>) {
        decl.accessible("label", AccessOptions::new(), |s| &s.label)
            .accessible("serial", AccessOptions::new().set(false), |s| &s.serial)
            .accessible("pin", AccessOptions::new().get(false), |s| &s.pin)
            .accessible(
                "calibration",
                AccessOptions::new().transfer(TypeTag::of::<Calibration>()),
                |s| &s.calibration,
            )
            .streamable("samples", |s| &s.samples)
            .callable("add", CallOptions::new(), |s, mut args| {
                s.add(args.take(0)?, args.take(1)?).into_real()
            })
            .callable("emit", CallOptions::new(), |s, mut args| {
                s.emit(args.take(0)?).into_real()
            })
            .callable("halt", CallOptions::new(), |s, _| s.halt().into_real())
            .callable("fail", CallOptions::new(), |_, _| -> Result<(), RpcError> {
                Err(RpcError::with_data(
                    ErrorCode::Internal,
                    "boom",
                    json!({"cause": "wiring"}),
                ))
            })
            .callable(
                "isRevived",
                CallOptions::new().transfer_arg(0, TypeTag::of::<Calibration>()),
                |s, mut args| s.is_revived(args.take(0)?).into_real(),
            )
            .callable(
                "current",
                CallOptions::new().transfer_return(TypeTag::of::<Calibration>()),
                |s, _| s.current().into_real(),
            )
            .callable("store", CallOptions::new(), |_, _| Ok(0usize))
            .callable_async("wait", CallOptions::new(), |s, mut args| async move {
                let millis: u64 = args.take(0)?;
                s.wait(millis).into_real()?.await
            })
            .callable_async(
                "snapshot",
                CallOptions::new().transfer_return(TypeTag::of::<Calibration>()),
                |s, _| async move { s.snapshot().into_real()?.await },
            )
            .on_init(|s: Arc<Sensor>| async move {
                s.initialized.store(true, Ordering::SeqCst);
                Ok(())
            });
    }
}

struct Unready {
    gate: Gate,
}

impl Remote for Unready {
    fn construct() -> Self {
        Unready {
            gate: Gate::new::<Unready>(),
        }
    }

    fn gate(&self) -> &Gate {
        &self.gate
    }

    fn declare(decl: &mut Declaration<Self>) {
        decl.on_init(|_| async { Err(RpcError::internal("not ready")) });
    }
}

const NOT_CONNECTED: &str =
    "the WorkerClient.connect() method must be called before a worker can be accessed";

fn channel_observer() -> (Observer<i64>, mpsc::UnboundedReceiver<Result<i64, RpcError>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let error_tx = tx.clone();
    let observer = Observer::new(move |value| {
        let _ = tx.send(Ok(value));
    })
    .on_error(move |err| {
        let _ = error_tx.send(Err(err));
    });
    (observer, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Result<i64, RpcError>>) -> Result<i64, RpcError> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

/// Forwards to an in-app worker and counts what the client posts.
struct CountingBus {
    inner: Arc<dyn MessageBus>,
    sent: Arc<AtomicUsize>,
}

impl MessageBus for CountingBus {
    fn post_message(&self, payload: Value) -> Result<(), TransportError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.inner.post_message(payload)
    }

    fn set_onmessage(&self, handler: MessageHandler) -> Result<(), TransportError> {
        self.inner.set_onmessage(handler)
    }

    fn terminate(&self) {
        self.inner.terminate();
    }
}

fn counting_client() -> (WorkerClient<Sensor>, Arc<AtomicUsize>) {
    let sent = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&sent);
    let definition = WorkerDefinition::<Sensor>::new(move || {
        let worker = InAppWorker::<Sensor>::start(true)?;
        Ok(Arc::new(CountingBus {
            inner: Arc::new(worker),
            sent: Arc::clone(&counter),
        }) as Arc<dyn MessageBus>)
    });
    (WorkerClient::new(definition, ClientConfig::default()), sent)
}

#[tokio::test]
async fn test_connect_runs_init_hook_once() {
    init_test_logging();
    let client = create_test_client::<Sensor>();
    let err = client.worker_instance().unwrap_err();
    assert_eq!(
        err.message,
        "Cannot access worker instance until the connect method has been called"
    );

    client.connect().await.unwrap();
    assert!(client.is_connected());
    let worker = client.worker_instance().unwrap();
    assert!(worker.initialized.load(Ordering::SeqCst));

    client.connect().await.unwrap();
    assert!(Arc::ptr_eq(&worker, &client.worker_instance().unwrap()));
}

#[tokio::test]
async fn test_requests_before_connect_are_refused() {
    let client = create_test_client::<Sensor>();
    let err = client.get(|s| s.label()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Precondition);
    assert_eq!(err.message, NOT_CONNECTED);
}

#[tokio::test]
async fn test_call_returns_result() {
    let client = create_test_client::<Sensor>();
    client.connect().await.unwrap();

    assert_eq!(client.call(|s| s.add(2, 3)).await.unwrap(), 5);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_get_and_set_round_trip() {
    let client = create_test_client::<Sensor>();
    client.connect().await.unwrap();

    assert_eq!(client.get(|s| s.label()).await.unwrap(), "probe");
    client.set(|s| s.label(), "kitchen".to_string()).await.unwrap();
    assert_eq!(client.get(|s| s.label()).await.unwrap(), "kitchen");
    assert_eq!(client.worker_instance().unwrap().label.get(), "kitchen");
}

#[tokio::test]
async fn test_disabled_accessors_reject_locally() {
    let client = create_test_client::<Sensor>();
    client.connect().await.unwrap();

    let err = client.get(|s| s.pin()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Capability);
    assert_eq!(
        err.message,
        "will not apply the get method to the \"pin\" property because the get accessor has been explicitly set to false"
    );

    let err = client.set(|s| s.serial(), "SN-8".to_string()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Capability);
    assert_eq!(
        err.message,
        "will not apply the set method to the \"serial\" property because the set accessor has been explicitly set to false"
    );
    assert_eq!(client.worker_instance().unwrap().serial.get(), "SN-7");
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_remote_error_keeps_message_and_fields() {
    let client = create_test_client::<Sensor>();
    client.connect().await.unwrap();

    let err = client.call(|s| s.fail()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Remote);
    assert_eq!(err.message, "boom");
    assert_eq!(err.remote_field("cause"), Some(&json!("wiring")));
}

#[tokio::test]
async fn test_real_value_is_not_a_capability() {
    let client = create_test_client::<Sensor>();
    client.connect().await.unwrap();
    let real = client.worker_instance().unwrap();

    let err = client.get(|_| real.label()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Capability);
    assert_eq!(err.message, "only members declared accessible can be used with get");
}

#[tokio::test]
async fn test_token_with_foreign_secret_is_refused() {
    let client = create_test_client::<Sensor>();
    client.connect().await.unwrap();

    let forged = CapabilityToken {
        secret: "CLIENT_0000000000000000".to_string(),
        kind: MemberKind::Call,
        member: "add".to_string(),
        payload: TokenPayload::Call {
            args: vec![json!(1), json!(1)],
        },
    };
    let options: RequestOptions<(), i64> = RequestOptions::new(
        MemberKind::Call,
        "call",
        TokenSource::Selected(Some(forged)),
        |_| Ok(()),
        |_, _| Ok(json!({"arguments": [1, 1]})),
        |value, _| Ok(serde_json::from_value(value)?),
    );
    let err = client.send_request(options).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Capability);
    assert_eq!(err.message, "only members declared callable can be used with call");
}

#[tokio::test]
async fn test_unencodable_arguments_are_a_dispatch_error() {
    let client = create_test_client::<Sensor>();
    client.connect().await.unwrap();

    let mut entries = BTreeMap::new();
    entries.insert((1, 2), 3);
    let err = client.call(|s| s.store(entries)).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Dispatch);
    assert_eq!(
        err.message,
        "Unable to serialize the request from the client to the worker"
    );
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_subscribe_delivers_until_unsubscribed() {
    let client = create_test_client::<Sensor>();
    client.connect().await.unwrap();
    let worker = client.worker_instance().unwrap();

    let (observer, mut rx) = channel_observer();
    let subscription = client.subscribe(|s| s.samples(), observer).await.unwrap();
    assert_eq!(client.subscription_count(), 1);
    assert_eq!(worker.samples.emitter().observer_count(), 1);

    client.call(|s| s.emit(1)).await.unwrap();
    client.call(|s| s.emit(2)).await.unwrap();
    assert_eq!(next_event(&mut rx).await.unwrap(), 1);
    assert_eq!(next_event(&mut rx).await.unwrap(), 2);

    client.unsubscribe(&subscription).await.unwrap();
    assert!(subscription.is_closed());
    assert_eq!(client.subscription_count(), 0);
    assert_eq!(worker.samples.emitter().observer_count(), 0);

    client.call(|s| s.emit(3)).await.unwrap();
    assert!(rx.try_recv().is_err());

    // a second unsubscribe is accepted without a request
    client.unsubscribe(&subscription).await.unwrap();
}

#[tokio::test]
async fn test_rejected_requests_post_nothing() {
    let (client, sent) = counting_client();
    client.connect().await.unwrap();
    assert_eq!(sent.load(Ordering::SeqCst), 1);
    sent.store(0, Ordering::SeqCst);

    assert!(client.get(|s| s.pin()).await.is_err());
    assert!(client.set(|s| s.serial(), "SN-9".to_string()).await.is_err());
    assert!(client.call_async(|s| s.snapshot()).await.is_err());
    let err = client.subscribe(|s| s.label().map(|_| Emitter::new()), channel_observer().0).await;
    assert!(err.is_err());
    assert_eq!(sent.load(Ordering::SeqCst), 0);

    client.call(|s| s.add(1, 1)).await.unwrap();
    assert_eq!(sent.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unsubscribe_twice_posts_one_request() {
    let (client, sent) = counting_client();
    client.connect().await.unwrap();

    let (observer, _rx) = channel_observer();
    let subscription = client.subscribe(|s| s.samples(), observer).await.unwrap();
    sent.store(0, Ordering::SeqCst);

    client.unsubscribe(&subscription).await.unwrap();
    client.unsubscribe(&subscription).await.unwrap();
    assert_eq!(sent.load(Ordering::SeqCst), 1);
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test]
async fn test_exhausted_subscription_keys_fail_the_subscribe() {
    let config = ClientConfig {
        subscription_key_length: 0,
        ..ClientConfig::in_app()
    };
    let client = WorkerClient::<Sensor>::new(WorkerDefinition::in_app_only(), config);
    client.connect().await.unwrap();

    let (first, _rx) = channel_observer();
    let _live = client.subscribe(|s| s.samples(), first).await.unwrap();
    let (second, _rx2) = channel_observer();
    let err = tokio::time::timeout(
        Duration::from_secs(2),
        client.subscribe(|s| s.samples(), second),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::Internal);
    assert_eq!(client.subscription_count(), 1);
}

#[tokio::test]
async fn test_stream_error_reaches_observer_and_retires_entry() {
    let client = create_test_client::<Sensor>();
    client.connect().await.unwrap();

    let (observer, mut rx) = channel_observer();
    let _subscription = client.subscribe(|s| s.samples(), observer).await.unwrap();
    client.call(|s| s.halt()).await.unwrap();

    let err = next_event(&mut rx).await.unwrap_err();
    assert_eq!(err.message, "sensor offline");
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test]
async fn test_observe_hands_back_a_view() {
    let client = create_test_client::<Sensor>();
    client.connect().await.unwrap();

    let remote = client.observe(|s| s.samples()).await.unwrap();
    let mut values = remote.stream();
    client.call(|s| s.emit(10)).await.unwrap();
    client.call(|s| s.emit(11)).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), values.next()).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), values.next()).await.unwrap();
    assert_eq!(first.unwrap().unwrap(), 10);
    assert_eq!(second.unwrap().unwrap(), 11);

    client.unsubscribe(&remote).await.unwrap();
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test]
async fn test_concurrent_subscriptions_are_independent() {
    let client = create_test_client::<Sensor>();
    client.connect().await.unwrap();

    let (first_observer, mut first) = channel_observer();
    let (second_observer, mut second) = channel_observer();
    let a = client.subscribe(|s| s.samples(), first_observer).await.unwrap();
    let _b = client.subscribe(|s| s.samples(), second_observer).await.unwrap();

    client.call(|s| s.emit(1)).await.unwrap();
    client.unsubscribe(&a).await.unwrap();
    client.call(|s| s.emit(2)).await.unwrap();

    assert_eq!(next_event(&mut first).await.unwrap(), 1);
    assert_eq!(next_event(&mut second).await.unwrap(), 1);
    assert_eq!(next_event(&mut second).await.unwrap(), 2);
    assert!(first.try_recv().is_err());
}

#[tokio::test]
async fn test_shallow_transfer_in_every_direction() {
    let client = create_test_client::<Sensor>();
    client.connect().await.unwrap();

    let calibration = Calibration {
        offset: 0.5,
        revived: false,
    };
    client.set(|s| s.calibration(), calibration.clone()).await.unwrap();
    assert!(client.worker_instance().unwrap().calibration.get().revived);

    let read = client.get(|s| s.calibration()).await.unwrap();
    assert_eq!(read.offset, 0.5);
    assert!(read.revived);

    assert!(client.call(|s| s.is_revived(calibration)).await.unwrap());

    let current = client.call(|s| s.current()).await.unwrap();
    assert!(current.revived);
}

#[tokio::test]
async fn test_return_tag_on_async_callable_is_refused() {
    let client = create_test_client::<Sensor>();
    client.connect().await.unwrap();

    let err = client.call_async(|s| s.snapshot()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Capability);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_slow_call_does_not_block_others() {
    let client = create_test_client::<Sensor>();
    client.connect().await.unwrap();

    let slow = client.call_async(|s| s.wait(200));
    let fast = async {
        let sum = client.call(|s| s.add(1, 1)).await.unwrap();
        (sum, std::time::Instant::now())
    };
    let started = std::time::Instant::now();
    let (slow, (sum, fast_done)) = tokio::join!(slow, fast);

    assert_eq!(slow.unwrap(), 200);
    assert_eq!(sum, 2);
    assert!(fast_done.duration_since(started) < Duration::from_millis(150));
}

#[tokio::test]
async fn test_request_timeout() {
    let config = ClientConfig::in_app().with_request_timeout(Duration::from_millis(30));
    let client = WorkerClient::<Sensor>::new(WorkerDefinition::in_app_only(), config);
    client.connect().await.unwrap();

    let err = client.call_async(|s| s.wait(1_000)).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Timeout);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_destroy_cancels_pending_and_allows_reconnect() {
    let client = create_test_client::<Sensor>();
    client.connect().await.unwrap();
    let (observer, _rx) = channel_observer();
    let _subscription = client.subscribe(|s| s.samples(), observer).await.unwrap();
    let worker = client.worker_instance().unwrap();

    let waiting = client.clone();
    let pending = tokio::spawn(async move { waiting.call_async(|s| s.wait(5_000)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.pending_count(), 1);

    client.destroy().await;
    assert!(!client.is_connected());
    assert_eq!(client.subscription_count(), 0);
    assert_eq!(client.pending_count(), 0);
    assert_eq!(worker.samples.emitter().observer_count(), 0);
    assert!(client.worker_instance().is_err());

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::Canceled);

    let err = client.call(|s| s.add(1, 2)).await.unwrap_err();
    assert_eq!(err.message, NOT_CONNECTED);

    client.connect().await.unwrap();
    assert_eq!(client.call(|s| s.add(1, 2)).await.unwrap(), 3);
    assert!(!Arc::ptr_eq(&worker, &client.worker_instance().unwrap()));
}

#[tokio::test]
async fn test_failed_init_rejects_connect() {
    let client = create_test_client::<Unready>();
    let err = client.connect().await.unwrap_err();
    assert_eq!(err.message, "not ready");
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_manager_requires_registration() {
    let manager = WorkerManager::new();
    let err = manager.create_client::<Sensor>(true).unwrap_err();
    assert_eq!(
        err.message,
        "all workers must be registered with the WorkerManager before a client can be created"
    );
}

#[tokio::test]
async fn test_threaded_worker_end_to_end() {
    init_test_logging();
    let manager = WorkerManager::new();
    manager
        .register(WorkerDefinition::<Sensor>::threaded(WorkerConfig::default()))
        .unwrap();
    let client = manager.create_client::<Sensor>(false).unwrap();
    client.connect().await.unwrap();

    assert_eq!(client.call(|s| s.add(20, 22)).await.unwrap(), 42);
    client.set(|s| s.label(), "attic".to_string()).await.unwrap();
    assert_eq!(client.get(|s| s.label()).await.unwrap(), "attic");
    assert!(client.in_app_instance().is_none());

    let (observer, mut rx) = channel_observer();
    let subscription = client.subscribe(|s| s.samples(), observer).await.unwrap();
    client.call(|s| s.emit(7)).await.unwrap();
    assert_eq!(next_event(&mut rx).await.unwrap(), 7);
    client.unsubscribe(&subscription).await.unwrap();

    let err = client.call(|s| s.fail()).await.unwrap_err();
    assert_eq!(err.message, "boom");

    client.destroy().await;
    assert!(!client.is_connected());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_concurrent_calls_settle_with_their_own_result(
        pairs in proptest::collection::vec((-1000i64..1000, -1000i64..1000), 1..24)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let results = runtime.block_on(async {
            let client = create_test_client::<Sensor>();
            client.connect().await.unwrap();
            let calls = pairs
                .iter()
                .map(|&(a, b)| client.call(move |s: &Sensor| s.add(a, b)));
            let results = futures::future::join_all(calls).await;
            client.destroy().await;
            results
        });

        for (result, (a, b)) in results.into_iter().zip(pairs) {
            prop_assert_eq!(result.unwrap(), a + b);
        }
    }
}
