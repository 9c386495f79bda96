//! Demo: publish through a `Producer` backed by the in-memory broker, lose
//! the session halfway, and watch the unconfirmed messages come back.

mod settings;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use herald_core::impls::ConfirmMode;
use herald_core::{InMemoryBroker, Producer};
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize)]
struct DeviceEvent<'a> {
    device: &'a str,
    online: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = settings::load()?;
    if config.exchange.is_empty() {
        config.exchange = "events".to_string();
    }
    // Keep the demo quick regardless of the configured delay.
    config.reconnect_delay = config.reconnect_delay.min(Duration::from_millis(200));

    // (A) broker that holds confirmations until told otherwise
    let broker = InMemoryBroker::new();
    broker.set_confirm_mode(ConfirmMode::Manual);
    let producer = Producer::connect(Arc::new(broker.clone()), config).await?;

    // (B) publish a few events; they are sent but stay unconfirmed
    for (device, online) in [("sensor-1", true), ("sensor-2", false), ("sensor-3", true)] {
        producer
            .publish(&format!("device.{device}"), &DeviceEvent { device, online })
            .await?;
    }
    timeout(Duration::from_secs(5), broker.wait_for_pending(3)).await?;
    info!(pending = broker.pending().len(), "Events sent, awaiting confirmation");

    // (C) drop the session; the producer reconnects and resubmits
    broker.kill_session("demo: connection reset");
    timeout(Duration::from_secs(5), broker.wait_for_epoch(2)).await?;
    timeout(Duration::from_secs(5), broker.wait_for_pending(3)).await?;
    broker.set_confirm_mode(ConfirmMode::AutoAck);
    broker.confirm_pending(true);

    while producer.counts().acked < 3 {
        sleep(Duration::from_millis(20)).await;
    }
    for d in broker.deliveries() {
        println!(
            "epoch={} tag={} key={} attempts={} body={}",
            d.epoch,
            d.tag,
            d.routing_key,
            d.message.attempts,
            d.message.body_lossy()
        );
    }
    println!("counts: {}", serde_json::to_string(&producer.counts())?);

    // (D) stop the worker
    producer.shutdown().await?;
    Ok(())
}
