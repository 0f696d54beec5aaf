//! Stdio Worker
//!
//! Hosts a counter behind a worker on stdin/stdout, framed as length-prefixed
//! JSON. Logs go to stderr and to a daily file, since stdout carries the bus.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use workerlink_core::{
    AccessOptions, Accessible, CallOptions, Declaration, Gate, Gated, Remote, Streamable,
};
use workerlink_transport::{EnvelopeCodec, StreamBus};
use workerlink_worker::{bootstrap_worker, init_logging};

/// Stateful counter that also publishes every new value.
struct Counter {
    gate: Gate,
    count: Accessible<i64>,
    changes: Streamable<i64>,
}

impl Counter {
    fn increment(&self, by: i64) -> Gated<i64> {
        self.gate.call("increment", (by,), |(by,)| {
            let value = self.count.update(|count| {
                *count += by;
                *count
            });
            self.changes.emitter().next(value);
            value
        })
    }
}

impl Remote for Counter {
    fn construct() -> Self {
        Counter {
            gate: Gate::new::<Counter>(),
            count: Accessible::new(0),
            changes: Streamable::new(),
        }
    }

    fn gate(&self) -> &Gate {
        &self.gate
    }

    fn declare(decl: &mut Declaration<Self>) {
        decl.accessible("count", AccessOptions::new(), |c| &c.count)
            .streamable("changes", |c| &c.changes)
            .callable("increment", CallOptions::new(), |c, mut args| {
                c.increment(args.take(0)?).into_real()
            });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_dir = std::env::args().nth(1).unwrap_or_else(|| "logs".to_string());
    init_logging(&log_dir, "workerlink-stdio-worker")?;

    let bus = Arc::new(StreamBus::spawn(
        tokio::io::stdin(),
        tokio::io::stdout(),
        EnvelopeCodec::new(),
    )?);
    let controller = bootstrap_worker::<Counter>(bus.clone())?;
    info!("stdio worker ready");

    bus.closed().await;
    controller.remove_all_subscriptions();
    info!("stdin closed, worker stopping");
    Ok(())
}
