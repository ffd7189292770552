//! Background sync worker
//!
//! Runs sync passes on a periodic tick, on explicit request, whenever
//! connectivity returns, and once the earliest retry backoff elapses. Going
//! offline or shutting down cancels the pass in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::SyncConfig;
use crate::models::SyncStatus;
use crate::state::SyncState;
use crate::util::now_millis;

use super::orchestrator::SyncOrchestrator;

/// Handle to a spawned sync loop.
pub struct SyncWorker {
    trigger: Arc<Notify>,
    online: watch::Sender<bool>,
    cancel: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<SyncState>,
    handle: JoinHandle<()>,
}

struct WorkerLoop {
    orchestrator: SyncOrchestrator,
    interval: Option<Duration>,
    retention: Duration,
    trigger: Arc<Notify>,
    online: watch::Receiver<bool>,
    cancel: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
    state: watch::Sender<SyncState>,
}

impl SyncWorker {
    /// Spawn the loop on the current tokio runtime. Stale in-flight entries
    /// are recovered before the first pass.
    pub fn spawn(orchestrator: SyncOrchestrator, config: &SyncConfig, online: bool) -> Self {
        let trigger = Arc::new(Notify::new());
        let (online_tx, online_rx) = watch::channel(online);
        let (cancel_tx, cancel_rx) = watch::channel(!online);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SyncState::Offline);

        let worker = WorkerLoop {
            orchestrator,
            interval: config.sync_interval(),
            retention: config.completed_retention(),
            trigger: Arc::clone(&trigger),
            online: online_rx,
            cancel: cancel_rx,
            shutdown: shutdown_rx,
            state: state_tx,
        };
        let handle = tokio::spawn(worker.run());

        Self {
            trigger,
            online: online_tx,
            cancel: cancel_tx,
            shutdown: shutdown_tx,
            state: state_rx,
            handle,
        }
    }

    /// Request a pass as soon as the worker is idle.
    pub fn sync_now(&self) {
        self.trigger.notify_one();
    }

    /// Report a connectivity change. Going offline cancels the pass in
    /// flight; coming back online starts a new one.
    pub fn set_online(&self, online: bool) {
        self.cancel.send_replace(!online);
        self.online.send_replace(online);
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    /// Cancel any pass in flight and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        self.cancel.send_replace(true);
        if let Err(error) = self.handle.await {
            tracing::error!("Sync worker task ended abnormally: {error}");
        }
    }
}

impl WorkerLoop {
    async fn run(mut self) {
        match self.orchestrator.queue().recover_stale().await {
            Ok(0) => {}
            Ok(count) => tracing::info!("Recovered {count} stale mutation(s) before syncing"),
            Err(error) => tracing::error!("Stale mutation recovery failed: {error}"),
        }

        let mut ticker = self.interval.map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        if *self.online.borrow() {
            self.state.send_replace(SyncState::Synced);
        }

        let mut retry_at: Option<Instant> = None;
        loop {
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                changed = self.online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    tracing::info!(
                        "Connectivity changed: {}",
                        if *self.online.borrow() { "online" } else { "offline" }
                    );
                }
                () = self.trigger.notified() => {
                    tracing::debug!("Sync requested");
                }
                () = tick(ticker.as_mut()) => {}
                () = wait_until(retry_at) => {
                    tracing::debug!("Retry backoff elapsed");
                }
            }

            if !*self.online.borrow() {
                // Reconnecting starts a pass anyway.
                retry_at = None;
                self.state.send_replace(SyncState::Offline);
                continue;
            }
            let started = now_millis();
            self.run_pass().await;
            retry_at = self.next_retry(started).await;
        }
        tracing::debug!("Sync worker stopped");
    }

    async fn run_pass(&self) {
        self.state.send_replace(SyncState::Syncing);
        let next = match self.orchestrator.sync_pass_with(&self.cancel).await {
            Ok(report) if report.cancelled => SyncState::Offline,
            Ok(_) => {
                self.purge_expired().await;
                SyncState::Synced
            }
            Err(error) => {
                tracing::error!("Sync pass failed: {error}");
                SyncState::Error
            }
        };
        self.state.send_replace(next);
    }

    /// When the earliest mutation the pass started at `started` found not yet
    /// due becomes due.
    async fn next_retry(&self, started: i64) -> Option<Instant> {
        let waiting = match self
            .orchestrator
            .queue()
            .by_status(&SyncStatus::SYNCABLE)
            .await
        {
            Ok(waiting) => waiting,
            Err(error) => {
                tracing::warn!("Reading retry schedule failed: {error}");
                return None;
            }
        };
        let earliest = waiting
            .iter()
            .filter_map(|mutation| mutation.next_attempt_at)
            .filter(|at| *at > started)
            .min()?;
        let delay = u64::try_from(earliest.saturating_sub(now_millis())).unwrap_or(0);
        tracing::debug!("Next retry in {delay} ms");
        Some(Instant::now() + Duration::from_millis(delay))
    }

    async fn purge_expired(&self) {
        let retention = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(retention);
        if let Err(error) = self.orchestrator.queue().purge_completed(cutoff).await {
            tracing::warn!("Purging completed mutations failed: {error}");
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{sample_loi, sample_survey, SqliteSurveyRepository, SurveyRepository};
    use crate::models::{
        JobId, LoiChange, LoiId, MutationPayload, MutationType, NewMutation, SurveyId, UserId,
    };
    use crate::services::{DatabaseService, MutationQueue};
    use crate::sync::{InMemoryRemoteStore, RemoteError, RetryPolicy};
    use std::collections::BTreeMap;

    fn manual_config() -> SyncConfig {
        SyncConfig {
            sync_interval_secs: None,
            ..SyncConfig::default()
        }
    }

    async fn setup() -> (MutationQueue, Arc<InMemoryRemoteStore>, SyncOrchestrator) {
        setup_with(RetryPolicy::immediate(3)).await
    }

    async fn setup_with(
        policy: RetryPolicy,
    ) -> (MutationQueue, Arc<InMemoryRemoteStore>, SyncOrchestrator) {
        let db = DatabaseService::open_in_memory().unwrap();
        db.transaction(|conn| SqliteSurveyRepository::new(conn).replace_survey(&sample_survey()))
            .await
            .unwrap();
        let queue = MutationQueue::new(db);
        let remote = Arc::new(InMemoryRemoteStore::new());
        let orchestrator = SyncOrchestrator::new(queue.clone(), remote.clone(), policy);

        queue
            .enqueue(
                NewMutation::at(
                    MutationType::Create,
                    SurveyId::from("s1"),
                    LoiId::from("l1"),
                    UserId::from("u1"),
                    100,
                    MutationPayload::LocationOfInterest(LoiChange {
                        job_id: JobId::from("j1"),
                        geometry: Some(sample_loi("l1", false).geometry),
                        custom_id: None,
                        properties: BTreeMap::new(),
                    }),
                )
                .unwrap(),
            )
            .await
            .unwrap();
        (queue, remote, orchestrator)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_now_drains_the_queue() {
        let (queue, remote, orchestrator) = setup().await;
        let worker = SyncWorker::spawn(orchestrator, &manual_config(), true);
        let mut state = worker.subscribe_state();

        worker.sync_now();
        state
            .wait_for(|state| *state == SyncState::Synced)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.all_pending().await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(remote.loi("l1").is_some());
        worker.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_worker_waits_for_connectivity() {
        let (queue, remote, orchestrator) = setup().await;
        let worker = SyncWorker::spawn(orchestrator, &manual_config(), false);

        worker.sync_now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.state(), SyncState::Offline);
        assert_eq!(remote.batch_calls(), 0);

        worker.set_online(true);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.all_pending().await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(remote.batch_calls(), 1);
        worker.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_failure_is_retried_once_backoff_elapses() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(150),
            max_delay: Duration::from_millis(150),
            multiplier: 1.0,
        };
        let (queue, remote, orchestrator) = setup_with(policy).await;
        remote.fail_next_batches(1, &RemoteError::unavailable("no signal"));
        let worker = SyncWorker::spawn(orchestrator, &manual_config(), true);

        // One explicit request; with no periodic tick only the backoff
        // wake-up can send the second attempt.
        worker.sync_now();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.all_pending().await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(remote.batch_calls(), 2);
        assert!(remote.loi("l1").is_some());
        worker.shutdown().await;
    }
}
