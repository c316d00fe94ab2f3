use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{DbspError, Result};
use crate::stream::{Peer, RemoteWorkerStream};

#[derive(Default)]
struct PoolState {
    idle: BTreeMap<u64, Arc<RemoteWorkerStream>>,
    reserved: BTreeMap<u64, Arc<RemoteWorkerStream>>,
}

/// Connected workers, either idle or reserved by a running job.
#[derive(Default)]
pub struct WorkerPool {
    state: Mutex<PoolState>,
    worker_added: Notify,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly connected worker as idle.
    pub fn add_worker(&self, worker: Arc<RemoteWorkerStream>) {
        let id = worker_id(&worker);
        let idle = {
            let mut state = self.lock();
            state.idle.insert(id, worker);
            state.idle.len()
        };
        tracing::info!(worker_id = id, idle, "Worker connected");
        self.worker_added.notify_waiters();
    }

    /// Forgets a worker whose connection has ended.
    pub fn remove_worker(&self, id: u64) -> bool {
        let mut state = self.lock();
        let removed = state.idle.remove(&id).is_some() || state.reserved.remove(&id).is_some();
        if removed {
            tracing::info!(worker_id = id, "Worker removed from pool");
        }
        removed
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn reserved_count(&self) -> usize {
        self.lock().reserved.len()
    }

    /// Waits until `count` idle workers exist and reserves exactly that many.
    ///
    /// Either all `count` workers are reserved or none is: when `cancel`
    /// fires first the pool is left untouched.
    pub async fn reserve_workers(
        &self,
        cancel: &CancellationToken,
        count: usize,
    ) -> Result<Vec<Arc<RemoteWorkerStream>>> {
        loop {
            let notified = self.worker_added.notified();
            tokio::pin!(notified);
            // Register before checking so an add between the check and the
            // wait is not missed.
            notified.as_mut().enable();

            if let Some(workers) = self.try_reserve(count) {
                discard_stale_payloads(&workers);
                tracing::info!(reserved = count, "Reserved workers for job");
                return Ok(workers);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => {
                    return Err(DbspError::ReservationFailed { requested: count });
                }
            }
        }
    }

    /// Like [`reserve_workers`](Self::reserve_workers) but gives up after
    /// `timeout` if one is set.
    pub async fn reserve_workers_within(
        &self,
        cancel: &CancellationToken,
        count: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<Arc<RemoteWorkerStream>>> {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.reserve_workers(cancel, count))
                .await
                .unwrap_or(Err(DbspError::ReservationFailed { requested: count })),
            None => self.reserve_workers(cancel, count).await,
        }
    }

    fn try_reserve(&self, count: usize) -> Option<Vec<Arc<RemoteWorkerStream>>> {
        let mut state = self.lock();
        if state.idle.len() < count {
            return None;
        }

        let ids: Vec<u64> = state.idle.keys().take(count).copied().collect();
        let mut workers = Vec::with_capacity(count);
        for id in ids {
            if let Some(worker) = state.idle.remove(&id) {
                state.reserved.insert(id, worker.clone());
                workers.push(worker);
            }
        }
        Some(workers)
    }

    /// Forcibly disconnects every idle and reserved worker. All close
    /// failures are collected rather than stopping at the first one.
    pub fn close(&self) -> Result<()> {
        let workers: Vec<Arc<RemoteWorkerStream>> = {
            let mut state = self.lock();
            let idle = std::mem::take(&mut state.idle);
            let reserved = std::mem::take(&mut state.reserved);
            idle.into_values().chain(reserved.into_values()).collect()
        };

        let errors: Vec<DbspError> = workers
            .iter()
            .filter_map(|worker| worker.disconnect().err())
            .collect();
        DbspError::from_many(errors)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Workers only speak once they have been handed a job, so anything queued
/// while they sat idle must not leak into the job that reserved them.
fn discard_stale_payloads(workers: &[Arc<RemoteWorkerStream>]) {
    for worker in workers {
        let discarded = worker.discard_received();
        if discarded > 0 {
            tracing::warn!(
                worker_id = worker_id(worker),
                discarded,
                "Discarded payloads sent by idle worker"
            );
        }
    }
}

fn worker_id(worker: &RemoteWorkerStream) -> u64 {
    match worker.peer() {
        Peer::Worker(id) => id,
        Peer::Master => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::codec::framed;

    fn worker(id: u64) -> Arc<RemoteWorkerStream> {
        Arc::new(RemoteWorkerStream::new(Peer::Worker(id)))
    }

    #[tokio::test]
    async fn reserves_lowest_ids_first() {
        let pool = WorkerPool::new();
        for id in [3, 1, 2] {
            pool.add_worker(worker(id));
        }

        let reserved = pool
            .reserve_workers(&CancellationToken::new(), 2)
            .await
            .unwrap();
        let ids: Vec<Peer> = reserved.iter().map(|w| w.peer()).collect();
        assert_eq!(ids, vec![Peer::Worker(1), Peer::Worker(2)]);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.reserved_count(), 2);

        assert!(pool.remove_worker(1));
        assert!(pool.remove_worker(3));
        assert!(!pool.remove_worker(3));
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.reserved_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_reservation_leaves_idle_workers() {
        let pool = Arc::new(WorkerPool::new());
        pool.add_worker(worker(1));

        let cancel = CancellationToken::new();
        let p = pool.clone();
        let c = cancel.clone();
        let pending = tokio::spawn(async move { p.reserve_workers(&c, 3).await });

        tokio::task::yield_now().await;
        pool.add_worker(worker(2));
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        cancel.cancel();
        assert!(matches!(
            pending.await.unwrap(),
            Err(DbspError::ReservationFailed { requested: 3 })
        ));
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.reserved_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reservation_races_concurrent_adds() {
        let pool = Arc::new(WorkerPool::new());
        let p = pool.clone();
        let pending =
            tokio::spawn(async move { p.reserve_workers(&CancellationToken::new(), 3).await });

        let adders: Vec<_> = (1..=8)
            .map(|id| {
                let p = pool.clone();
                tokio::spawn(async move { p.add_worker(worker(id)) })
            })
            .collect();
        for adder in adders {
            adder.await.unwrap();
        }

        let reserved = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("reservation missed a wake-up")
            .unwrap()
            .unwrap();
        assert_eq!(reserved.len(), 3);
        assert_eq!(pool.idle_count(), 5);
        assert_eq!(pool.reserved_count(), 3);
    }

    #[tokio::test]
    async fn close_reports_disconnected_reserved_workers() {
        let pool = WorkerPool::new();
        let healthy = worker(1);
        let broken = worker(2);
        pool.add_worker(healthy.clone());
        pool.add_worker(broken.clone());

        let (healthy_io, _healthy_peer) = tokio::io::duplex(1024);
        let (broken_io, broken_peer) = tokio::io::duplex(1024);
        let h = healthy.clone();
        let healthy_pump = tokio::spawn(async move { h.handle_send_recv(framed(healthy_io)).await });
        let b = broken.clone();
        let broken_pump = tokio::spawn(async move { b.handle_send_recv(framed(broken_io)).await });

        let reserved = pool
            .reserve_workers(&CancellationToken::new(), 2)
            .await
            .unwrap();
        assert_eq!(reserved.len(), 2);

        drop(broken_peer);
        assert!(matches!(
            broken_pump.await.unwrap(),
            Err(DbspError::WorkerDisconnected(2))
        ));

        assert!(matches!(
            pool.close(),
            Err(DbspError::WorkerDisconnected(2))
        ));
        assert!(healthy_pump.await.unwrap().is_ok());
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.reserved_count(), 0);
    }

    #[tokio::test]
    async fn close_disconnects_idle_workers() {
        let pool = WorkerPool::new();
        pool.add_worker(worker(1));
        pool.add_worker(worker(2));
        pool.close().unwrap();
        assert_eq!(pool.idle_count(), 0);
    }
}
