use super::{OutcomeFuture, SendRequest, Transport, TransportError};
use crate::batch::{FailureReason, OperationId, Outcome};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// What the simulated remote does with one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Succeeds after the latency, unless the capacity budget is exhausted.
    Succeed,
    /// Fails after the latency.
    Fail(String),
    /// Refuses synchronously; no future is returned.
    Reject(String),
    /// Panics inside the future after the latency.
    Panic,
    /// Panics in `send` itself, before any future exists.
    PanicOnSend,
    /// Never resolves.
    Hang,
}

/// Call counters shared between the transport and its futures.
#[derive(Debug, Default)]
pub struct SimStats {
    calls: AtomicUsize,
    aborts: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    stored_bytes: AtomicU64,
}

impl SimStats {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
    /// Futures handed out and not yet finished or dropped.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
    pub fn stored_bytes(&self) -> u64 {
        self.stored_bytes.load(Ordering::SeqCst)
    }
}

struct InFlightGuard(Arc<SimStats>);

impl InFlightGuard {
    fn enter(stats: &Arc<SimStats>) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(Arc::clone(stats))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Capacity {
    limit: u64,
    used: u64,
}

/// A stand-in for a disposable object store.
///
/// Outcomes are scripted per operation; with a capacity budget, successful
/// writes consume payload bytes and writes that no longer fit fail the way a
/// full disk does.
pub struct SimulatedTransport {
    default_script: Script,
    scripts: HashMap<OperationId, Script>,
    latency: Duration,
    latencies: HashMap<OperationId, Duration>,
    capacity: Option<Arc<Mutex<Capacity>>>,
    stats: Arc<SimStats>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self {
            default_script: Script::Succeed,
            scripts: HashMap::new(),
            latency: Duration::ZERO,
            latencies: HashMap::new(),
            capacity: None,
            stats: Arc::new(SimStats::default()),
        }
    }

    pub fn with_default_script(mut self, script: Script) -> Self {
        self.default_script = script;
        self
    }

    pub fn with_script(mut self, id: impl Into<OperationId>, script: Script) -> Self {
        self.scripts.insert(id.into(), script);
        self
    }

    /// Fail every listed operation with a transport error.
    pub fn failing(mut self, ids: impl IntoIterator<Item = usize>) -> Self {
        for i in ids {
            self.scripts.insert(
                OperationId(i),
                Script::Fail(format!("simulated failure for operation {i}")),
            );
        }
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_latency_for(mut self, id: impl Into<OperationId>, latency: Duration) -> Self {
        self.latencies.insert(id.into(), latency);
        self
    }

    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(Arc::new(Mutex::new(Capacity {
            limit: bytes,
            used: 0,
        })));
        self
    }

    pub fn stats(&self) -> Arc<SimStats> {
        Arc::clone(&self.stats)
    }

    fn script_for(&self, id: OperationId) -> Script {
        self.scripts
            .get(&id)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimulatedTransport {
    fn send(&self, request: SendRequest) -> Result<OutcomeFuture, TransportError> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        let id = request.id;
        let script = self.script_for(id);
        match &script {
            Script::Reject(msg) => return Err(TransportError::Unavailable(msg.clone())),
            Script::PanicOnSend => panic!("simulated send panic for operation {id}"),
            _ => {}
        }

        let latency = self.latencies.get(&id).copied().unwrap_or(self.latency);
        let capacity = self.capacity.clone();
        let stats = Arc::clone(&self.stats);
        let payload = request.payload;
        let guard = InFlightGuard::enter(&self.stats);

        Ok(Box::pin(async move {
            let _guard = guard;
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            match script {
                Script::Succeed => {
                    let size = match payload.len().await {
                        Ok(n) => n,
                        Err(e) => {
                            return Outcome::failure(FailureReason::transport(format!(
                                "cannot read payload: {e}"
                            )))
                        }
                    };
                    if let Some(cap) = capacity {
                        let mut cap = cap.lock().unwrap_or_else(PoisonError::into_inner);
                        if cap.used + size > cap.limit {
                            return Outcome::failure(FailureReason::transport(format!(
                                "insufficient storage: {} of {} bytes used, {} requested",
                                cap.used, cap.limit, size
                            )));
                        }
                        cap.used += size;
                    }
                    stats.stored_bytes.fetch_add(size, Ordering::SeqCst);
                    Outcome::Success
                }
                Script::Fail(msg) => Outcome::failure(FailureReason::transport(msg)),
                Script::Panic => panic!("simulated transport panic for operation {id}"),
                Script::Hang => futures::future::pending().await,
                Script::Reject(_) | Script::PanicOnSend => {
                    unreachable!("handled before the future was built")
                }
            }
        }))
    }

    fn abort(&self, _id: OperationId) {
        self.stats.aborts.fetch_add(1, Ordering::SeqCst);
    }
}
