//! Capacity Exhaustion Example
//!
//! Twenty concurrent uploads of a 64 KiB payload against a store that only has
//! room for 1 MiB. The store fills up after sixteen uploads and the rest fail;
//! the batch still drains and reports exactly which uploads failed.
//!
//! Usage:
//!   cargo run --example capacity_exhaustion

use std::sync::Arc;
use std::time::Duration;
use upload_batch::batch::{Batch, BatchConfig, PayloadRef};
use upload_batch::telemetry::{BatchEvent, BatchEventSink, InMemoryEventSink};
use upload_batch::transport::SimulatedTransport;

const PAYLOAD_BYTES: usize = 64 * 1024;
const CAPACITY_BYTES: u64 = 1024 * 1024;

#[tokio::main]
async fn main() -> upload_batch::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== Upload Batch: capacity exhaustion ===\n");

    let store = SimulatedTransport::new()
        .with_latency(Duration::from_millis(20))
        .with_capacity(CAPACITY_BYTES);
    let stats = store.stats();
    let events = Arc::new(InMemoryEventSink::new(1_000));

    let payload = PayloadRef::bytes(vec![7u8; PAYLOAD_BYTES]);
    let batch = Batch::builder()
        .config(BatchConfig::new().with_concurrency_limit(5))
        .sink(events.clone() as Arc<dyn BatchEventSink>)
        .spawn(Arc::new(store), (0..20).map(|_| payload.clone()))?;

    let result = batch.wait_timeout(Duration::from_secs(30)).await?;

    println!("succeeded: {}", result.success_count());
    println!("failed:    {}", result.failure_count());
    for (id, reason) in &result.failures {
        println!("  upload {id}: {reason}");
    }
    println!(
        "stored {} of {} bytes, peak concurrency {}",
        stats.stored_bytes(),
        CAPACITY_BYTES,
        stats.peak_in_flight()
    );

    let completed = events
        .events()
        .iter()
        .filter(|e| matches!(e, BatchEvent::Completed { .. }))
        .count();
    println!("completion events observed: {completed}");
    println!("permits after drain: {:?}", batch.snapshot().permits);
    Ok(())
}
