use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::http::ApiClient;
use crate::rpc::{self, JobGroupId};

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct HeartbeatHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Keeps remote sandboxes alive with a periodic heartbeat RPC per job group.
/// At most one task runs per `job_group_id`; individual RPC failures are
/// swallowed so a network blip never tears a session down.
pub struct HeartbeatScheduler {
    api: ApiClient,
    interval: Duration,
    tasks: DashMap<JobGroupId, HeartbeatHandle>,
}

impl HeartbeatScheduler {
    pub fn new(api: ApiClient, interval: Duration) -> Self {
        Self {
            api,
            interval,
            tasks: DashMap::new(),
        }
    }

    /// Launch the keep-alive loop. The first heartbeat fires immediately.
    /// Starting an already-started job group is a no-op.
    pub fn start(&self, job_group_id: JobGroupId) {
        let entry = self.tasks.entry(job_group_id.clone());
        let dashmap::mapref::entry::Entry::Vacant(vacant) = entry else {
            tracing::debug!(%job_group_id, "heartbeat already running");
            return;
        };

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let api = self.api.clone();
        let interval = self.interval;
        let jgid = job_group_id.clone();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = rpc::heartbeat(&api, &jgid).await {
                            tracing::debug!(?err, %jgid, "heartbeat failed; retrying on next tick");
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            tracing::debug!(%jgid, "heartbeat stopped");
        });

        vacant.insert(HeartbeatHandle {
            stop: stop_tx,
            join,
        });
        tracing::debug!(%job_group_id, interval_secs = interval.as_secs(), "heartbeat started");
    }

    /// Cancel and join the loop for one job group. Idempotent; joining is
    /// bounded, with an abort as the backstop.
    pub async fn stop(&self, job_group_id: &JobGroupId) {
        let Some((_, handle)) = self.tasks.remove(job_group_id) else {
            return;
        };
        let _ = handle.stop.send(true);
        let mut join = handle.join;
        if tokio::time::timeout(STOP_JOIN_TIMEOUT, &mut join).await.is_err() {
            tracing::warn!(%job_group_id, "heartbeat task did not stop in time; aborting");
            join.abort();
        }
    }

    pub fn is_running(&self, job_group_id: &JobGroupId) -> bool {
        self.tasks.contains_key(job_group_id)
    }

    pub async fn stop_all(&self) {
        let ids: Vec<JobGroupId> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop(&id).await;
        }
    }
}
