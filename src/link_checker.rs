//! Link health checking.
//!
//! A check session probes a fixed snapshot of targets with a small pool of
//! workers. Every state change bumps or re-reads the session epoch; a worker
//! only commits a result while the epoch it was spawned under is still
//! current, so probes that were in flight across a pause or cancel are
//! discarded and their items re-queued instead of being counted twice.

use crate::errors::{AppError, AppResult};
use crate::models::{CheckProgress, CheckState, LinkCategory, LinkCheckResult, LinkTarget};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

const PROBE_USER_AGENT: &str = concat!("tab-archive/", env!("CARGO_PKG_VERSION"));
const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Status(u16),
    Timeout,
    NetworkError(String),
}

/// Maps a probe outcome to its category. Server errors are treated as
/// transient, so only 4xx responses count as dead.
pub fn categorize(outcome: &ProbeOutcome) -> LinkCategory {
    match outcome {
        ProbeOutcome::Status(status) if (200..400).contains(status) => LinkCategory::Alive,
        ProbeOutcome::Status(status) if (400..500).contains(status) => LinkCategory::Dead,
        _ => LinkCategory::Warning,
    }
}

#[async_trait]
pub trait LinkProbe: Send + Sync {
    async fn probe(&self, url: &str) -> ProbeOutcome;
}

/// Probes over HTTP with a HEAD request, retrying as GET for servers that
/// refuse HEAD.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// The client carries no timeout of its own; each check session bounds
    /// its probes with the timeout it was started with.
    pub fn new() -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(PROBE_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|error| AppError::Internal(format!("failed to build http client: {}", error)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl LinkProbe for HttpProbe {
    async fn probe(&self, url: &str) -> ProbeOutcome {
        match self.client.head(url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if status != 405 && status != 501 {
                    return ProbeOutcome::Status(status);
                }
                match self.client.get(url).send().await {
                    Ok(response) => ProbeOutcome::Status(response.status().as_u16()),
                    Err(error) => request_failure(error),
                }
            }
            Err(error) => request_failure(error),
        }
    }
}

fn request_failure(error: reqwest::Error) -> ProbeOutcome {
    if error.is_timeout() {
        ProbeOutcome::Timeout
    } else {
        ProbeOutcome::NetworkError(error.to_string())
    }
}

#[derive(Debug, Default)]
struct Session {
    state: CheckState,
    epoch: u64,
    targets: Vec<LinkTarget>,
    results: Vec<Option<LinkCategory>>,
    cursor: usize,
    requeued: VecDeque<usize>,
    in_flight: HashSet<usize>,
    checked: usize,
    alive: usize,
    dead: usize,
    warning: usize,
    concurrency: usize,
    probe_timeout: Duration,
}

impl Session {
    fn next_index(&mut self) -> Option<usize> {
        if let Some(index) = self.requeued.pop_front() {
            return Some(index);
        }
        if self.cursor < self.targets.len() {
            self.cursor += 1;
            return Some(self.cursor - 1);
        }
        None
    }

    fn remaining(&self) -> usize {
        self.requeued.len() + (self.targets.len() - self.cursor)
    }

    /// Invalidates running workers and puts their unfinished items back at
    /// the head of the queue in target order.
    fn freeze(&mut self) {
        self.epoch += 1;
        let mut pending: Vec<usize> = self.in_flight.drain().collect();
        pending.sort_unstable();
        for index in pending.into_iter().rev() {
            self.requeued.push_front(index);
        }
    }

    fn record(&mut self, index: usize, category: LinkCategory) {
        self.in_flight.remove(&index);
        let Some(slot) = self.results.get_mut(index) else {
            return;
        };
        if slot.is_some() {
            return;
        }
        *slot = Some(category);
        self.checked += 1;
        match category {
            LinkCategory::Alive => self.alive += 1,
            LinkCategory::Dead => self.dead += 1,
            LinkCategory::Warning => self.warning += 1,
        }
        if self.checked == self.targets.len() {
            self.state = CheckState::Completed;
        }
    }

    fn progress(&self) -> CheckProgress {
        CheckProgress {
            state: self.state,
            epoch: self.epoch,
            total_count: self.targets.len(),
            checked_count: self.checked,
            alive: self.alive,
            dead: self.dead,
            warning: self.warning,
        }
    }
}

struct Inner {
    probe: Arc<dyn LinkProbe>,
    session: Mutex<Session>,
    progress: watch::Sender<CheckProgress>,
}

/// Cancellable, resumable link checker. Cheap to clone; clones share one
/// session.
#[derive(Clone)]
pub struct LinkChecker {
    inner: Arc<Inner>,
}

impl LinkChecker {
    pub fn new(probe: Arc<dyn LinkProbe>) -> Self {
        let (progress, _) = watch::channel(CheckProgress::default());
        Self {
            inner: Arc::new(Inner {
                probe,
                session: Mutex::new(Session::default()),
                progress,
            }),
        }
    }

    /// Starts a new session over `targets`. The target list is a snapshot:
    /// later changes to the archive do not affect the running session. Each
    /// probe that outlives `probe_timeout` counts as a timeout.
    pub async fn start(
        &self,
        targets: Vec<LinkTarget>,
        concurrency: usize,
        probe_timeout: Duration,
    ) -> AppResult<CheckProgress> {
        let mut session = self.inner.session.lock().await;
        if session.state == CheckState::Running {
            return Err(AppError::InvalidState(
                "a link check is already running".to_string(),
            ));
        }
        let epoch = session.epoch + 1;
        let total = targets.len();
        *session = Session {
            state: CheckState::Running,
            epoch,
            results: vec![None; total],
            targets,
            concurrency: concurrency.max(1),
            probe_timeout,
            ..Session::default()
        };
        if total == 0 {
            session.state = CheckState::Completed;
        }
        tracing::info!(epoch, total, concurrency = session.concurrency, "link check started");
        self.spawn_workers(&session);
        Ok(self.publish(&session))
    }

    pub async fn pause(&self) -> AppResult<CheckProgress> {
        let mut session = self.inner.session.lock().await;
        match session.state {
            CheckState::Paused => {}
            CheckState::Running => {
                session.freeze();
                session.state = CheckState::Paused;
                tracing::info!(epoch = session.epoch, checked = session.checked, "link check paused");
            }
            other => {
                return Err(AppError::InvalidState(format!(
                    "cannot pause a link check that is {}",
                    other.as_str()
                )));
            }
        }
        Ok(self.publish(&session))
    }

    /// Continues a paused or cancelled session from where it stopped.
    pub async fn resume(&self) -> AppResult<CheckProgress> {
        let mut session = self.inner.session.lock().await;
        match session.state {
            CheckState::Running | CheckState::Completed => {}
            CheckState::Paused | CheckState::Cancelled => {
                session.epoch += 1;
                session.state = if session.checked == session.targets.len() {
                    CheckState::Completed
                } else {
                    CheckState::Running
                };
                tracing::info!(
                    epoch = session.epoch,
                    checked = session.checked,
                    remaining = session.remaining(),
                    "link check resumed"
                );
                self.spawn_workers(&session);
            }
            CheckState::Idle => {
                return Err(AppError::InvalidState(
                    "no link check to resume".to_string(),
                ));
            }
        }
        Ok(self.publish(&session))
    }

    /// Stops issuing probes. Results already recorded are kept; probes still
    /// in flight are dropped when they return.
    pub async fn cancel(&self) -> AppResult<CheckProgress> {
        let mut session = self.inner.session.lock().await;
        match session.state {
            CheckState::Cancelled => {}
            CheckState::Running | CheckState::Paused => {
                session.freeze();
                session.state = CheckState::Cancelled;
                tracing::info!(epoch = session.epoch, checked = session.checked, "link check cancelled");
            }
            other => {
                return Err(AppError::InvalidState(format!(
                    "cannot cancel a link check that is {}",
                    other.as_str()
                )));
            }
        }
        Ok(self.publish(&session))
    }

    /// Drops the session and its results.
    pub async fn reset(&self) -> CheckProgress {
        let mut session = self.inner.session.lock().await;
        let epoch = session.epoch + 1;
        *session = Session {
            epoch,
            ..Session::default()
        };
        self.publish(&session)
    }

    pub fn progress(&self) -> CheckProgress {
        *self.inner.progress.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CheckProgress> {
        self.inner.progress.subscribe()
    }

    /// Waits until the session is no longer running.
    pub async fn wait_until_settled(&self) -> AppResult<CheckProgress> {
        let mut receiver = self.subscribe();
        let progress = receiver
            .wait_for(|progress| progress.state != CheckState::Running)
            .await
            .map_err(|_| AppError::Internal("link check progress channel closed".to_string()))?;
        Ok(*progress)
    }

    /// Checked items in target order.
    pub async fn results(&self) -> Vec<LinkCheckResult> {
        let session = self.inner.session.lock().await;
        session
            .targets
            .iter()
            .zip(session.results.iter())
            .filter_map(|(target, category)| {
                category.map(|category| LinkCheckResult {
                    tab_id: target.tab_id.clone(),
                    url: target.url.clone(),
                    category,
                })
            })
            .collect()
    }

    pub async fn results_by_category(&self, category: LinkCategory) -> Vec<LinkCheckResult> {
        self.results()
            .await
            .into_iter()
            .filter(|result| result.category == category)
            .collect()
    }

    fn publish(&self, session: &Session) -> CheckProgress {
        let progress = session.progress();
        self.inner.progress.send_replace(progress);
        progress
    }

    fn spawn_workers(&self, session: &Session) {
        if session.state != CheckState::Running {
            return;
        }
        let workers = session.concurrency.min(session.remaining());
        for _ in 0..workers {
            let checker = self.clone();
            let epoch = session.epoch;
            tokio::spawn(async move {
                checker.run_worker(epoch).await;
            });
        }
    }

    async fn run_worker(self, epoch: u64) {
        loop {
            let (index, url, probe_timeout) = {
                let mut session = self.inner.session.lock().await;
                if session.epoch != epoch || session.state != CheckState::Running {
                    return;
                }
                let Some(index) = session.next_index() else {
                    return;
                };
                session.in_flight.insert(index);
                (index, session.targets[index].url.clone(), session.probe_timeout)
            };

            let outcome = tokio::time::timeout(probe_timeout, self.inner.probe.probe(&url))
                .await
                .unwrap_or(ProbeOutcome::Timeout);
            let category = categorize(&outcome);

            let mut session = self.inner.session.lock().await;
            if session.epoch != epoch {
                tracing::debug!(epoch, current = session.epoch, url = %url, "discarding stale probe result");
                return;
            }
            if let ProbeOutcome::NetworkError(error) = &outcome {
                tracing::debug!(url = %url, error = %error, "link probe failed");
            }
            session.record(index, category);
            if session.state == CheckState::Completed {
                tracing::info!(
                    epoch,
                    alive = session.alive,
                    dead = session.dead,
                    warning = session.warning,
                    "link check completed"
                );
            }
            self.publish(&session);
        }
    }
}
