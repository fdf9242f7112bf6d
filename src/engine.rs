//! Worker-pool orchestrator: pulls chunks from the scheduler, fans probe
//! tasks out across a fixed-size worker pool, and flushes batched results to
//! the store.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collaborators::{NoopThermalGovernor, ThermalGovernor};
use crate::error::ScanError;
use crate::fingerprint;
use crate::probes;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::types::{Analysis, Observation};

const BATCH_THRESHOLD: usize = 50;
const WORK_CHANNEL_CAPACITY: usize = 1024;
const EMPTY_QUEUE_POLL: Duration = Duration::from_secs(5);
const INTER_CHUNK_YIELD_EVERY: u64 = 5;
const PRUNE_EVERY: u64 = 50;

pub struct EngineConfig {
    pub target: Option<String>,
    pub priority: i64,
    pub ports: Vec<u16>,
    pub rate: usize,
    pub run_loop: bool,
    pub max_load: f64,
    pub cool_down: f64,
}

pub struct Engine {
    store: Store,
    scheduler: Scheduler,
    config: EngineConfig,
    thermal: Arc<dyn ThermalGovernor>,
}

impl Engine {
    /// Opens the store, runs the startup SCANNING-chunk recovery sweep, and
    /// returns a ready-to-run engine.
    pub async fn bootstrap(db_path: impl AsRef<std::path::Path>, config: EngineConfig) -> Result<Self, ScanError> {
        let store = Store::open(db_path).await?;
        let orphaned = store.reset_orphaned_scanning_chunks().await?;
        if orphaned > 0 {
            warn!(orphaned, "swept orphaned SCANNING chunks back to QUEUED");
        }

        let scheduler = Scheduler::new(store.clone());
        Ok(Self { store, scheduler, config, thermal: Arc::new(NoopThermalGovernor) })
    }

    pub fn with_thermal_governor(mut self, governor: Arc<dyn ThermalGovernor>) -> Self {
        self.thermal = governor;
        self
    }

    /// Runs the outer scan loop until the queue drains (one-shot mode) or
    /// the cancellation token fires (continuous mode).
    pub async fn run(&self) -> Result<(), ScanError> {
        if let Some(target) = &self.config.target {
            self.scheduler.initialize(target, self.config.priority).await?;
        }

        let cancel = CancellationToken::new();
        let ctrlc_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received, finishing in-flight work");
            ctrlc_cancel.cancel();
        });

        info!(rate = self.config.rate, ports = self.config.ports.len(), "engine started");

        let mut chunks_processed: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            while self.thermal.should_pause(self.config.max_load, self.config.cool_down) {
                if cancel.is_cancelled() {
                    break;
                }
                sleep(Duration::from_secs(30)).await;
            }
            if cancel.is_cancelled() {
                break;
            }

            if chunks_processed > 0 && chunks_processed % PRUNE_EVERY == 0 {
                match self.store.prune_old_data(30, 90).await {
                    Ok((history, services)) if history > 0 || services > 0 => {
                        info!(history, services, "pruned old data");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "prune failed"),
                }
            }

            let next = self.scheduler.next_chunk().await?;
            let Some((chunk_id, start, end)) = next else {
                if !self.config.run_loop {
                    info!("queue empty, exiting");
                    break;
                }
                sleep(EMPTY_QUEUE_POLL).await;
                continue;
            };

            let (Ok(start_ip), Ok(end_ip)) = (start.parse::<Ipv4Addr>(), end.parse::<Ipv4Addr>()) else {
                error!(chunk_id, start, end, "invalid chunk range");
                self.scheduler.fail(chunk_id, "Invalid Range").await?;
                continue;
            };

            match self.run_chunk(chunk_id, start_ip, end_ip, &cancel).await {
                Ok(()) if cancel.is_cancelled() => {
                    // Only part of the chunk was probed; leave it SCANNING so
                    // the startup orphan sweep reclaims it on next boot rather
                    // than marking it falsely COMPLETED.
                    info!(chunk_id, "interrupted mid-chunk, leaving for recovery");
                    break;
                }
                Ok(()) => {
                    self.scheduler.complete(chunk_id).await?;
                    chunks_processed += 1;
                    if chunks_processed % INTER_CHUNK_YIELD_EVERY == 0 {
                        sleep(Duration::from_secs(1)).await;
                    }
                }
                Err(e) => {
                    error!(chunk_id, error = %e, "chunk execution failed");
                    self.scheduler.fail(chunk_id, e.to_string()).await?;
                }
            }
        }

        Ok(())
    }

    /// Expands one chunk into (ip, port) work items, drains them through a
    /// fixed-size worker pool, and flushes the final batch.
    async fn run_chunk(&self, chunk_id: i64, start: Ipv4Addr, end: Ipv4Addr, cancel: &CancellationToken) -> Result<(), ScanError> {
        info!(chunk_id, %start, %end, "starting chunk");

        let (tx, rx) = mpsc::channel::<(Ipv4Addr, u16)>(WORK_CHANNEL_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));
        let batch: Arc<Mutex<Vec<(Observation, Analysis)>>> = Arc::new(Mutex::new(Vec::new()));

        let mut workers = Vec::with_capacity(self.config.rate);
        for _ in 0..self.config.rate {
            let rx = rx.clone();
            let batch = batch.clone();
            let store = self.store.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(rx, batch, store, cancel).await;
            }));
        }

        let start_u32 = u32::from(start);
        let end_u32 = u32::from(end);
        'fill: for raw_ip in start_u32..=end_u32 {
            let ip = Ipv4Addr::from(raw_ip);
            for &port in &self.config.ports {
                if cancel.is_cancelled() {
                    break 'fill;
                }
                if tx.send((ip, port)).await.is_err() {
                    break 'fill;
                }
            }
        }
        drop(tx);

        for handle in workers {
            let _ = handle.await;
        }

        let mut guard = batch.lock().await;
        if !guard.is_empty() {
            let drained = std::mem::take(&mut *guard);
            drop(guard);
            self.store.save_observation_batch(drained).await?;
        }

        info!(chunk_id, "chunk complete");
        Ok(())
    }
}

async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<(Ipv4Addr, u16)>>>,
    batch: Arc<Mutex<Vec<(Observation, Analysis)>>>,
    store: Store,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let item = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some((ip, port)) = item else { return };

        let probe = probes::for_port(port);
        let observation = probe.run(ip).await;
        let analysis = fingerprint::analyze(&observation);

        if observation.status == crate::types::ObservationStatus::Open {
            info!(%ip, port, vendor = %analysis.vendor, product = %analysis.product, "open port");
        }

        let to_flush = {
            let mut guard = batch.lock().await;
            guard.push((observation, analysis));
            if guard.len() >= BATCH_THRESHOLD {
                Some(std::mem::take(&mut *guard))
            } else {
                None
            }
        };

        if let Some(drained) = to_flush {
            if let Err(e) = store.save_observation_batch(drained).await {
                error!(error = %e, "batch flush failed");
            }
        }
    }
}
