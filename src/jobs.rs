use crate::{
    models::{ApiError, ListingRequest, ListingResponse},
    security::AuthContext,
    submission::Publisher,
};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
    retention: Duration,
}

struct JobEntry {
    state: JobState,
    finished: Option<Instant>,
}

impl JobEntry {
    fn pending(state: JobState) -> Self {
        Self {
            state,
            finished: None,
        }
    }
}

#[derive(Clone)]
struct Job {
    id: Uuid,
    request: ListingRequest,
    context: AuthContext,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: ListingResponse },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    /// Single worker: queued listings are submitted one after another.
    /// Completed jobs stay pollable for `retention`, then are dropped.
    pub fn spawn(publisher: Publisher, capacity: usize, retention: Duration) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                {
                    let mut guard = statuses_bg.lock().await;
                    guard.insert(job.id, JobEntry::pending(JobState::Running));
                }
                info!(
                    target = "publisher.jobs",
                    job_id = %job.id,
                    operator = %job.context.operator,
                    subject_id = %job.request.subject_id,
                    "job started"
                );

                let result = publisher.submit(job.request).await;
                let mut guard = statuses_bg.lock().await;
                guard.insert(
                    job.id,
                    JobEntry {
                        state: JobState::Completed { result },
                        finished: Some(Instant::now()),
                    },
                );
            }
        });

        (
            Self {
                tx,
                statuses,
                retention,
            },
            handle,
        )
    }

    pub async fn enqueue_listing(
        &self,
        request: ListingRequest,
        context: AuthContext,
    ) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            self.prune(&mut guard);
            guard.insert(id, JobEntry::pending(JobState::Queued));
        }
        let job = Job {
            id,
            request,
            context,
        };
        if self.tx.send(job).await.is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("worker not available".into()),
            });
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let mut guard = self.statuses.lock().await;
        self.prune(&mut guard);
        guard.get(&id).map(|entry| JobInfo {
            id: id.to_string(),
            state: entry.state.clone(),
        })
    }

    fn prune(&self, statuses: &mut HashMap<Uuid, JobEntry>) {
        let before = statuses.len();
        statuses.retain(|_, entry| {
            entry
                .finished
                .is_none_or(|finished| finished.elapsed() < self.retention)
        });
        let evicted = before - statuses.len();
        if evicted > 0 {
            debug!(target = "publisher.jobs", evicted, "expired job statuses dropped");
        }
    }
}
