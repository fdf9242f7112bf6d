//! CIDR chunking and the chunk priority queue lifecycle.

use std::sync::atomic::{AtomicI64, Ordering};

use ipnet::Ipv4Net;
use tracing::{info, warn};

use crate::error::SchedulerError;
use crate::store::Store;
use crate::types::ChunkStatus;

const MAX_RETRIES: i64 = 3;
const CHUNK_ADDRESS_LIMIT: u32 = 256;
const MAINTENANCE_INTERVAL_SECS: i64 = 3600;

/// Priority queue over `ScanChunk`s backed by the store's `scan_state` table.
pub struct Scheduler {
    store: Store,
    last_maintenance_ts: AtomicI64,
}

impl Scheduler {
    pub fn new(store: Store) -> Self {
        Self { store, last_maintenance_ts: AtomicI64::new(0) }
    }

    /// Split `cidr` into chunks and enqueue them at `priority`.
    pub async fn initialize(&self, cidr: &str, priority: i64) -> Result<(), SchedulerError> {
        let network: Ipv4Net = cidr.parse().map_err(|_| SchedulerError::InvalidCidr(cidr.to_string()))?;
        info!(%network, priority, "initializing scan");

        let total_addresses: u64 = 1u64 << (32 - network.prefix_len() as u32);
        if total_addresses <= CHUNK_ADDRESS_LIMIT as u64 {
            self.enqueue_whole_network(cidr, network, priority).await?;
        } else if network.prefix_len() < 24 {
            for subnet in network.subnets(24).map_err(|_| SchedulerError::InvalidCidr(cidr.to_string()))? {
                self.store
                    .create_scan_chunk(cidr.to_string(), subnet.network().to_string(), subnet.broadcast().to_string(), priority)
                    .await?;
            }
        } else {
            self.enqueue_whole_network(cidr, network, priority).await?;
        }

        Ok(())
    }

    async fn enqueue_whole_network(&self, cidr: &str, network: Ipv4Net, priority: i64) -> Result<(), SchedulerError> {
        self.store
            .create_scan_chunk(cidr.to_string(), network.network().to_string(), network.broadcast().to_string(), priority)
            .await?;
        Ok(())
    }

    /// Fetch and claim the next chunk, enforcing the retry ceiling and
    /// running periodic maintenance first. Loops in place (rather than
    /// recursing) past any run of chunks that have exceeded their retry
    /// ceiling, so a long dead streak can't grow the call stack.
    pub async fn next_chunk(&self) -> Result<Option<(i64, String, String)>, SchedulerError> {
        self.maintain_queue_health().await?;

        loop {
            let Some((id, start, end, retry_count)) = self.store.get_next_chunk().await? else {
                return Ok(None);
            };

            if retry_count >= MAX_RETRIES {
                warn!(chunk_id = id, retry_count, "chunk exceeded max retries, marking FAILED");
                self.store
                    .update_chunk_status(id, ChunkStatus::Failed, Some("Max Retries Exceeded".to_string()))
                    .await?;
                continue;
            }

            self.store.update_chunk_status(id, ChunkStatus::Scanning, None).await?;
            return Ok(Some((id, start, end)));
        }
    }

    pub async fn complete(&self, chunk_id: i64) -> Result<(), SchedulerError> {
        self.store.update_chunk_status(chunk_id, ChunkStatus::Completed, None).await?;
        Ok(())
    }

    pub async fn fail(&self, chunk_id: i64, error: impl Into<String>) -> Result<(), SchedulerError> {
        self.store.update_chunk_status(chunk_id, ChunkStatus::Retrying, Some(error.into())).await?;
        Ok(())
    }

    /// Anti-starvation promotion plus auto-rescan of stale COMPLETED chunks.
    /// Rate-limited to once per hour.
    async fn maintain_queue_health(&self) -> Result<(), SchedulerError> {
        let now = now_secs();
        let last = self.last_maintenance_ts.load(Ordering::Relaxed);
        if now - last < MAINTENANCE_INTERVAL_SECS {
            return Ok(());
        }

        info!("running scheduler queue maintenance");

        let promoted = self.store.promote_ignored_chunks(48).await?;
        if promoted > 0 {
            info!(promoted, "promoted ignored chunks");
        }

        for chunk_id in self.store.get_stale_chunks(50, true, 24).await? {
            self.store.reset_stale_chunk(chunk_id).await?;
        }
        for chunk_id in self.store.get_stale_chunks(50, false, 168).await? {
            self.store.reset_stale_chunk(chunk_id).await?;
        }

        self.last_maintenance_ts.store(now_secs(), Ordering::Relaxed);
        Ok(())
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (Scheduler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("sched.db")).await.unwrap();
        (Scheduler::new(store), dir)
    }

    #[tokio::test]
    async fn small_network_becomes_single_chunk() {
        let (scheduler, _dir) = open_temp().await;
        scheduler.initialize("192.168.1.0/28", 1).await.unwrap();
        let (_, start, end) = scheduler.next_chunk().await.unwrap().unwrap();
        assert_eq!(start, "192.168.1.0");
        assert_eq!(end, "192.168.1.15");
    }

    #[tokio::test]
    async fn large_network_splits_into_slash_24s() {
        let (scheduler, _dir) = open_temp().await;
        scheduler.initialize("10.0.0.0/22", 1).await.unwrap();
        let mut seen = Vec::new();
        while let Some((id, ..)) = scheduler.next_chunk().await.unwrap() {
            scheduler.complete(id).await.unwrap();
            seen.push(id);
            if seen.len() >= 4 {
                break;
            }
        }
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn invalid_cidr_is_rejected() {
        let (scheduler, _dir) = open_temp().await;
        let err = scheduler.initialize("not-a-cidr", 1).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCidr(_)));
    }

    #[tokio::test]
    async fn higher_priority_chunk_dequeues_first() {
        let (scheduler, _dir) = open_temp().await;
        scheduler.initialize("192.168.1.0/28", 1).await.unwrap();
        scheduler.initialize("192.168.2.0/28", 5).await.unwrap();

        let (_, start, _) = scheduler.next_chunk().await.unwrap().unwrap();
        assert_eq!(start, "192.168.2.0");
    }

    #[tokio::test]
    async fn retry_ceiling_forces_failed_and_skips_chunk() {
        let (scheduler, _dir) = open_temp().await;
        scheduler.initialize("192.168.1.0/28", 1).await.unwrap();
        let (id, ..) = scheduler.next_chunk().await.unwrap().unwrap();

        for _ in 0..MAX_RETRIES {
            scheduler.fail(id, "transient").await.unwrap();
            scheduler.next_chunk().await.unwrap();
        }

        assert!(scheduler.next_chunk().await.unwrap().is_none());
    }
}
