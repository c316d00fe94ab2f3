//! Lock-step synchronization of the job phases.
//!
//! Every worker reports each [`StepType`] exactly once and in order. A
//! worker's [`StepBarrier::wait`] only returns after the master has seen all
//! `N` workers report the step ([`StepBarrier::wait_for_workers`]) and has
//! released it ([`StepBarrier::notify_workers`]). Cancelling the job token
//! unblocks every waiter.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{DbspError, Result};
use crate::proto::StepType;

#[derive(Debug, Clone)]
struct BarrierState {
    released: Option<StepType>,
    arrivals: [usize; 3],
    last_reported: Vec<Option<StepType>>,
}

impl BarrierState {
    fn record(&mut self, participant: usize, step: StepType) -> Result<()> {
        let last = self.last_reported.get_mut(participant).ok_or_else(|| {
            DbspError::ProtocolViolation(format!("unknown barrier participant {participant}"))
        })?;
        let expected = match *last {
            None => Some(StepType::ExecutedGraph),
            Some(prev) => prev.next(),
        };
        if expected != Some(step) {
            return Err(DbspError::ProtocolViolation(format!(
                "participant {participant} reported {step} out of order"
            )));
        }
        *last = Some(step);
        self.arrivals[step.index()] += 1;
        Ok(())
    }
}

/// Fixed-size, forward-only barrier shared by the master and the receive
/// tasks of one job.
#[derive(Debug)]
pub struct StepBarrier {
    num_workers: usize,
    state: watch::Sender<BarrierState>,
    cancel: CancellationToken,
}

impl StepBarrier {
    pub fn new(num_workers: usize, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(BarrierState {
            released: None,
            arrivals: [0; 3],
            last_reported: vec![None; num_workers],
        });
        Self {
            num_workers,
            state,
            cancel,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// The last step the master released.
    pub fn released(&self) -> Option<StepType> {
        self.state.borrow().released
    }

    pub fn arrivals(&self, step: StepType) -> usize {
        self.state.borrow().arrivals[step.index()]
    }

    /// Records that `participant` reached `step` without waiting for the
    /// other participants.
    pub fn arrive(&self, participant: usize, step: StepType) -> Result<()> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| match state.record(participant, step) {
            Ok(()) => true,
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        outcome
    }

    /// Records that `participant` reached `step` and blocks until the master
    /// releases it. Returns the released step.
    pub async fn wait(&self, participant: usize, step: StepType) -> Result<StepType> {
        self.arrive(participant, step)?;

        let mut rx = self.state.subscribe();
        tokio::select! {
            res = rx.wait_for(|state| state.released >= Some(step)) => {
                res.map(|_| step).map_err(|_| DbspError::Cancelled)
            }
            _ = self.cancel.cancelled() => Err(DbspError::Cancelled),
        }
    }

    /// Blocks until every worker has reported `step`.
    pub async fn wait_for_workers(&self, step: StepType) -> Result<StepType> {
        let num_workers = self.num_workers;
        let mut rx = self.state.subscribe();
        tokio::select! {
            res = rx.wait_for(|state| state.arrivals[step.index()] >= num_workers) => {
                res.map(|_| step).map_err(|_| DbspError::Cancelled)
            }
            _ = self.cancel.cancelled() => Err(DbspError::Cancelled),
        }
    }

    /// Releases every worker blocked on `step`.
    pub fn notify_workers(&self, step: StepType) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(DbspError::Cancelled);
        }
        let num_workers = self.num_workers;
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| {
            if state.arrivals[step.index()] < num_workers {
                outcome = Err(DbspError::ProtocolViolation(format!(
                    "cannot release {step}: only {} of {num_workers} workers reported it",
                    state.arrivals[step.index()]
                )));
                return false;
            }
            if state.released >= Some(step) {
                outcome = Err(DbspError::ProtocolViolation(format!(
                    "step {step} was already released"
                )));
                return false;
            }
            state.released = Some(step);
            true
        });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn releases_all_participants_together() {
        let barrier = Arc::new(StepBarrier::new(3, CancellationToken::new()));

        let mut waiters = Vec::new();
        for participant in 0..2 {
            let b = barrier.clone();
            waiters.push(tokio::spawn(async move {
                b.wait(participant, StepType::ExecutedGraph).await
            }));
        }

        let b = barrier.clone();
        let master = tokio::spawn(async move {
            b.wait_for_workers(StepType::ExecutedGraph).await?;
            b.notify_workers(StepType::ExecutedGraph)
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));
        assert!(!master.is_finished());
        assert_eq!(barrier.arrivals(StepType::ExecutedGraph), 2);

        let b = barrier.clone();
        waiters.push(tokio::spawn(async move {
            b.wait(2, StepType::ExecutedGraph).await
        }));

        master.await.unwrap().unwrap();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), StepType::ExecutedGraph);
        }
        assert_eq!(barrier.released(), Some(StepType::ExecutedGraph));
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiters() {
        let cancel = CancellationToken::new();
        let barrier = Arc::new(StepBarrier::new(2, cancel.clone()));

        let b = barrier.clone();
        let waiter = tokio::spawn(async move { b.wait(0, StepType::ExecutedGraph).await });
        let b = barrier.clone();
        let master =
            tokio::spawn(async move { b.wait_for_workers(StepType::ExecutedGraph).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert!(matches!(waiter.await.unwrap(), Err(DbspError::Cancelled)));
        assert!(matches!(master.await.unwrap(), Err(DbspError::Cancelled)));
        assert!(matches!(
            barrier.notify_workers(StepType::ExecutedGraph),
            Err(DbspError::Cancelled)
        ));
    }

    #[test]
    fn steps_must_be_reported_in_order() {
        let barrier = StepBarrier::new(2, CancellationToken::new());

        let err = barrier.arrive(0, StepType::PersistedResults).unwrap_err();
        assert!(matches!(err, DbspError::ProtocolViolation(_)));

        barrier.arrive(0, StepType::ExecutedGraph).unwrap();
        let err = barrier.arrive(0, StepType::ExecutedGraph).unwrap_err();
        assert!(matches!(err, DbspError::ProtocolViolation(_)));

        let err = barrier.arrive(5, StepType::ExecutedGraph).unwrap_err();
        assert!(matches!(err, DbspError::ProtocolViolation(_)));

        assert_eq!(barrier.arrivals(StepType::ExecutedGraph), 1);
    }

    #[test]
    fn notify_requires_every_worker() {
        let barrier = StepBarrier::new(2, CancellationToken::new());
        barrier.arrive(0, StepType::ExecutedGraph).unwrap();
        assert!(barrier.notify_workers(StepType::ExecutedGraph).is_err());

        barrier.arrive(1, StepType::ExecutedGraph).unwrap();
        barrier.notify_workers(StepType::ExecutedGraph).unwrap();
        assert!(barrier.notify_workers(StepType::ExecutedGraph).is_err());
    }

    #[tokio::test]
    async fn completed_job_arrivals_need_no_release() {
        let barrier = StepBarrier::new(1, CancellationToken::new());
        for step in [StepType::ExecutedGraph, StepType::PersistedResults] {
            barrier.arrive(0, step).unwrap();
            barrier.wait_for_workers(step).await.unwrap();
            barrier.notify_workers(step).unwrap();
        }
        barrier.arrive(0, StepType::CompletedJob).unwrap();
        assert_eq!(
            barrier.wait_for_workers(StepType::CompletedJob).await.unwrap(),
            StepType::CompletedJob
        );
    }
}
