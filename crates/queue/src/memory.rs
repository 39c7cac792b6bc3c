use crate::{Job, JobHandler, JobOptions, JobQueue, JobState, QueueError};
use async_trait::async_trait;
use chrono::Utc;
use common::types::JsonValue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

const FAILED_HISTORY_LIMIT: usize = 100;

struct QueueState {
    waiting: VecDeque<Job>,
    active: HashMap<Uuid, Job>,
    /// Active jobs removed while running; their results are dropped.
    discarded: HashSet<Uuid>,
    failed: VecDeque<Job>,
    notify: Arc<Notify>,
    processing: bool,
}

impl QueueState {
    fn new() -> Self {
        Self {
            waiting: VecDeque::new(),
            active: HashMap::new(),
            discarded: HashSet::new(),
            failed: VecDeque::new(),
            notify: Arc::new(Notify::new()),
            processing: false,
        }
    }
}

/// In-process queue with per-queue dispatcher tasks and semaphore-bounded
/// worker concurrency.
pub struct InMemoryQueue {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn settle(
        queues: &Mutex<HashMap<String, QueueState>>,
        name: &str,
        job: Job,
        outcome: Result<(), String>,
    ) {
        let mut map = queues.lock().await;
        let state = match map.get_mut(name) {
            Some(state) => state,
            None => return,
        };

        state.active.remove(&job.id);
        if state.discarded.remove(&job.id) {
            debug!(job_id = %job.id, queue = name, "discarding result of removed job");
            return;
        }

        if let Err(message) = outcome {
            let mut job = job;
            job.attempts_made += 1;
            if job.attempts_made < job.options.attempts {
                warn!(
                    job_id = %job.id,
                    queue = name,
                    attempt = job.attempts_made,
                    error = %message,
                    "job failed, re-delivering"
                );
                state.waiting.push_back(job);
                state.notify.notify_one();
            } else {
                warn!(
                    job_id = %job.id,
                    queue = name,
                    error = %message,
                    "job failed, attempts exhausted"
                );
                state.failed.push_back(job);
                if state.failed.len() > FAILED_HISTORY_LIMIT {
                    state.failed.pop_front();
                }
            }
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn add(&self, name: &str, payload: JsonValue, options: JobOptions) -> Uuid {
        let job = Job {
            id: Uuid::new_v4(),
            queue: name.to_string(),
            payload,
            options,
            attempts_made: 0,
            enqueued_at: Utc::now(),
        };
        let job_id = job.id;

        let mut map = self.queues.lock().await;
        let state = map.entry(name.to_string()).or_insert_with(QueueState::new);
        state.waiting.push_back(job);
        state.notify.notify_one();
        job_id
    }

    async fn process(
        &self,
        name: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError> {
        let notify = {
            let mut map = self.queues.lock().await;
            let state = map.entry(name.to_string()).or_insert_with(QueueState::new);
            if state.processing {
                return Err(QueueError::AlreadyProcessing(name.to_string()));
            }
            state.processing = true;
            state.notify.clone()
        };

        let queues = self.queues.clone();
        let name = name.to_string();
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        tokio::spawn(async move {
            loop {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                // Claim the next waiting job, or sleep until one arrives.
                let job = loop {
                    let claimed = {
                        let mut map = queues.lock().await;
                        let state = map
                            .entry(name.clone())
                            .or_insert_with(QueueState::new);
                        match state.waiting.pop_front() {
                            Some(job) => {
                                state.active.insert(job.id, job.clone());
                                Some(job)
                            }
                            None => None,
                        }
                    };
                    match claimed {
                        Some(job) => break job,
                        None => notify.notified().await,
                    }
                };

                let queues = queues.clone();
                let name = name.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let timeout = Duration::from_millis(job.options.timeout_ms);
                    let outcome =
                        match tokio::time::timeout(timeout, handler.handle(job.clone())).await {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(e)) => Err(e.to_string()),
                            Err(_) => Err(format!(
                                "job timed out after {} ms",
                                job.options.timeout_ms
                            )),
                        };
                    InMemoryQueue::settle(&queues, &name, job, outcome).await;
                });
            }
        });

        Ok(())
    }

    async fn remove(&self, job_id: Uuid) -> bool {
        let mut map = self.queues.lock().await;
        for state in map.values_mut() {
            let before = state.waiting.len();
            state.waiting.retain(|job| job.id != job_id);
            if state.waiting.len() != before {
                return true;
            }
            if state.active.contains_key(&job_id) {
                state.discarded.insert(job_id);
                return true;
            }
        }
        false
    }

    async fn get_jobs(&self, name: &str, states: &[JobState]) -> Vec<Job> {
        let map = self.queues.lock().await;
        let state = match map.get(name) {
            Some(state) => state,
            None => return Vec::new(),
        };

        let mut jobs = Vec::new();
        for wanted in states {
            match wanted {
                JobState::Waiting => jobs.extend(state.waiting.iter().cloned()),
                JobState::Active => jobs.extend(state.active.values().cloned()),
                JobState::Failed => jobs.extend(state.failed.iter().cloned()),
            }
        }
        jobs
    }
}
