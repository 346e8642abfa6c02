//! Common bus machinery.
//!
//! Every typed bus is built on a [`BusCore`]: a bounded FIFO queue, one
//! background worker task, and lifecycle/stat bookkeeping. Synchronous bus
//! operations bypass the queue entirely and resolve a provider on the
//! caller's task; only fire-and-forget operations go through the worker.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──start(processor)──▶ worker running ──stop()──▶ drained (bounded) ──▶ gone
//! ```
//!
//! After `stop()` the queue refuses new messages; the worker drains what is
//! already queued until the drain deadline, then the task is aborted.

use crate::mindfabric::service::ServiceType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Envelope carried by every queued bus message.
#[derive(Debug, Clone)]
pub struct BusEnvelope {
    pub id: Uuid,
    pub handler_name: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl BusEnvelope {
    pub fn new(handler_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            handler_name: handler_name.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Point-in-time queue statistics for one bus.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BusStats {
    pub queued: usize,
    pub processed: u64,
    pub failed: u64,
    pub avg_processing_ms: f64,
}

/// Worker-side handler for queued messages.
#[async_trait]
pub trait MessageProcessor<M: Send + 'static>: Send + Sync {
    async fn process_message(&self, message: M) -> Result<(), String>;
}

/// Bounded queue + worker shared by every bus.
pub struct BusCore<M: Send + 'static> {
    service_type: ServiceType,
    capacity: usize,
    tx: mpsc::Sender<M>,
    // Held until `start` hands it to the worker task.
    rx: StdMutex<Option<mpsc::Receiver<M>>>,
    running: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    busy_micros: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// How long `stop()` lets the worker drain already-queued messages.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

impl<M: Send + 'static> BusCore<M> {
    pub fn new(service_type: ServiceType, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            service_type,
            capacity: capacity.max(1),
            tx,
            rx: StdMutex::new(Some(rx)),
            running: Arc::new(AtomicBool::new(false)),
            processed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            busy_micros: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
        }
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Messages currently waiting in the queue.
    pub fn queue_size(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// Enqueue a message. Returns `false` when the bus is stopped or the
    /// queue is full; back-pressure is a signal to the caller, not a
    /// latent failure.
    pub fn enqueue(&self, message: M) -> bool {
        if !self.is_running() {
            warn!("{} bus is not running, dropping message", self.service_type);
            return false;
        }
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("{} bus queue full, rejecting message", self.service_type);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Launch the background worker. A second call is a no-op.
    pub async fn start(&self, processor: Arc<dyn MessageProcessor<M>>) {
        let mut receiver = match self.rx.lock().expect("bus receiver lock poisoned").take() {
            Some(rx) => rx,
            None => {
                debug!("{} bus already started", self.service_type);
                return;
            }
        };

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let processed = Arc::clone(&self.processed);
        let failed = Arc::clone(&self.failed);
        let busy_micros = Arc::clone(&self.busy_micros);
        let service_type = self.service_type;

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let message =
                    match tokio::time::timeout(Duration::from_millis(100), receiver.recv()).await {
                        Ok(Some(message)) => message,
                        Ok(None) => break,
                        Err(_) => continue,
                    };
                Self::handle(&*processor, message, &processed, &failed, &busy_micros).await;
            }

            // Stop requested: drain whatever is already queued, bounded.
            let deadline = Instant::now() + DRAIN_TIMEOUT;
            while Instant::now() < deadline {
                match receiver.try_recv() {
                    Ok(message) => {
                        Self::handle(&*processor, message, &processed, &failed, &busy_micros).await;
                    }
                    Err(_) => break,
                }
            }
            debug!("{} bus worker exited", service_type);
        });

        *self.worker.lock().await = Some(handle);
        debug!("{} bus worker started", self.service_type);
    }

    async fn handle(
        processor: &dyn MessageProcessor<M>,
        message: M,
        processed: &AtomicU64,
        failed: &AtomicU64,
        busy_micros: &AtomicU64,
    ) {
        let start = Instant::now();
        match processor.process_message(message).await {
            Ok(()) => {
                processed.fetch_add(1, Ordering::SeqCst);
            }
            Err(reason) => {
                failed.fetch_add(1, Ordering::SeqCst);
                error!("bus worker failed to process message: {}", reason);
            }
        }
        busy_micros.fetch_add(start.elapsed().as_micros() as u64, Ordering::SeqCst);
    }

    /// Stop the worker: refuse new messages, let the worker drain, and
    /// abort it if the drain overruns.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(DRAIN_TIMEOUT + Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                warn!("{} bus worker did not stop in time, abandoning", self.service_type);
            }
        }
    }

    pub fn stats(&self) -> BusStats {
        let processed = self.processed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let busy_micros = self.busy_micros.load(Ordering::SeqCst);
        let handled = processed + failed;
        BusStats {
            queued: self.queue_size(),
            processed,
            failed,
            avg_processing_ms: if handled == 0 {
                0.0
            } else {
                busy_micros as f64 / handled as f64 / 1000.0
            },
        }
    }
}

/// Processor for buses whose operations are all synchronous: a queued
/// message on such a bus is a programming error and is logged away.
pub struct SyncOnlyProcessor {
    service_type: ServiceType,
}

impl SyncOnlyProcessor {
    pub fn new(service_type: ServiceType) -> Self {
        Self { service_type }
    }
}

#[async_trait]
impl MessageProcessor<BusEnvelope> for SyncOnlyProcessor {
    async fn process_message(&self, message: BusEnvelope) -> Result<(), String> {
        warn!(
            "{} operations are synchronous, got queued message {} from {}",
            self.service_type, message.id, message.handler_name
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingProcessor {
        seen: Arc<AtomicU64>,
    }

    #[async_trait]
    impl MessageProcessor<BusEnvelope> for CountingProcessor {
        async fn process_message(&self, _message: BusEnvelope) -> Result<(), String> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn worker_processes_in_fifo_order_and_counts() {
        let core = BusCore::new(ServiceType::Communication, 16);
        let seen = Arc::new(AtomicU64::new(0));
        core.start(Arc::new(CountingProcessor {
            seen: Arc::clone(&seen),
        }))
        .await;

        for _ in 0..5 {
            assert!(core.enqueue(BusEnvelope::new("h")));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert_eq!(core.stats().processed, 5);

        core.stop().await;
        assert!(!core.enqueue(BusEnvelope::new("h")));
    }

    #[tokio::test]
    async fn full_queue_rejects_enqueue() {
        // Never started: the queue fills and enqueue must refuse.
        let core = BusCore::new(ServiceType::Audit, 2);
        core.running.store(true, Ordering::SeqCst);
        assert!(core.enqueue(BusEnvelope::new("h")));
        assert!(core.enqueue(BusEnvelope::new("h")));
        assert!(!core.enqueue(BusEnvelope::new("h")));
        assert_eq!(core.queue_size(), 2);
    }
}
