use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::Duration,
};

use futures_util::StreamExt;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    backend::{BackendError, FragmentStream},
    metrics::{AppMetrics, SessionGuard},
    models::Fragment,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    TimedOut,
    Failed,
}

impl SessionOutcome {
    pub fn label(self) -> &'static str {
        match self {
            SessionOutcome::Completed => "completed",
            SessionOutcome::Cancelled => "cancelled",
            SessionOutcome::TimedOut => "timed_out",
            SessionOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("no output within {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// One generation request from acceptance to its terminal state.
///
/// The session owns the only cancellation token for its upstream call. The
/// token fires on an external stop (the parent token or the registry), on the
/// fixed deadline, or when the session is dropped because the receiving side
/// went away. The first terminal state recorded is final.
///
/// Once opened, the upstream stream lives in a pump task that drops it as
/// soon as the token fires or the deadline passes, whether or not anyone is
/// reading.
pub struct StreamSession {
    id: Uuid,
    token: CancellationToken,
    timeout: Duration,
    deadline: Instant,
    outcome: OnceLock<SessionOutcome>,
    fragments: Option<mpsc::Receiver<Result<Fragment, BackendError>>>,
    produced: u64,
    metrics: Option<SessionGuard>,
    _registration: Option<Registration>,
}

enum Step {
    Stopped,
    Deadline,
    Item(Option<Result<Fragment, BackendError>>),
}

impl StreamSession {
    pub fn new(timeout: Duration, parent: &CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            token: parent.child_token(),
            timeout,
            deadline: Instant::now() + timeout,
            outcome: OnceLock::new(),
            fragments: None,
            produced: 0,
            metrics: None,
            _registration: None,
        }
    }

    pub fn with_metrics(mut self, metrics: &Arc<AppMetrics>) -> Self {
        self.metrics = Some(metrics.session_guard());
        self
    }

    /// Adopts an id chosen by the caller. Must come before `register`.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn register(mut self, registry: &Arc<SessionRegistry>) -> Self {
        self._registration = Some(registry.register(self.id, self.token.clone()));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.outcome.get().copied()
    }

    pub fn fragments_produced(&self) -> u64 {
        self.produced
    }

    /// Races the upstream open against the stop signal and the deadline.
    pub async fn start<F>(&mut self, open: F) -> Result<(), SessionError>
    where
        F: Future<Output = Result<FragmentStream, BackendError>>,
    {
        let token = self.token.clone();
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.settle(SessionOutcome::Cancelled);
                return Ok(());
            }
            _ = sleep_until(self.deadline) => {
                self.token.cancel();
                self.settle(SessionOutcome::TimedOut);
                return Err(SessionError::TimedOut(self.timeout));
            }
            opened = open => opened,
        };

        match opened {
            Ok(stream) => {
                self.fragments = Some(self.spawn_pump(stream));
                Ok(())
            }
            Err(BackendError::Cancelled(_)) => {
                self.settle(SessionOutcome::Cancelled);
                Ok(())
            }
            Err(error) => {
                self.token.cancel();
                self.settle(SessionOutcome::Failed);
                Err(error.into())
            }
        }
    }

    /// `Ok(None)` is a clean end: completion, cancellation, or a deadline
    /// hit after output was already produced.
    pub async fn next_fragment(&mut self) -> Result<Option<Fragment>, SessionError> {
        if self.outcome.get().is_some() {
            return Ok(None);
        }
        let Some(fragments) = self.fragments.as_mut() else {
            return Ok(None);
        };

        let token = self.token.clone();
        let step = tokio::select! {
            biased;
            _ = token.cancelled() => Step::Stopped,
            _ = sleep_until(self.deadline) => Step::Deadline,
            item = fragments.recv() => Step::Item(item),
        };

        match step {
            Step::Item(Some(Ok(fragment))) => {
                self.produced += 1;
                Ok(Some(fragment))
            }
            Step::Stopped | Step::Item(Some(Err(BackendError::Cancelled(_)))) => {
                self.finish(SessionOutcome::Cancelled);
                Ok(None)
            }
            Step::Deadline => {
                self.finish(SessionOutcome::TimedOut);
                if self.produced == 0 {
                    Err(SessionError::TimedOut(self.timeout))
                } else {
                    Ok(None)
                }
            }
            Step::Item(None) => {
                let outcome = if self.token.is_cancelled() {
                    SessionOutcome::Cancelled
                } else {
                    SessionOutcome::Completed
                };
                self.finish(outcome);
                Ok(None)
            }
            Step::Item(Some(Err(error))) => {
                if self.token.is_cancelled() {
                    self.finish(SessionOutcome::Cancelled);
                    return Ok(None);
                }
                self.finish(SessionOutcome::Failed);
                Err(error.into())
            }
        }
    }

    /// Capacity one keeps the upstream read paced by the consumer.
    fn spawn_pump(
        &self,
        mut stream: FragmentStream,
    ) -> mpsc::Receiver<Result<Fragment, BackendError>> {
        let (tx, rx) = mpsc::channel(1);
        let token = self.token.clone();
        let deadline = self.deadline;
        let id = self.id;

        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = sleep_until(deadline) => break,
                    item = stream.next() => item,
                };
                let Some(item) = item else {
                    break;
                };
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = sleep_until(deadline) => break,
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            drop(stream);
            debug!(session_id = %id, "upstream stream released");
        });

        rx
    }

    fn finish(&mut self, outcome: SessionOutcome) {
        self.token.cancel();
        self.fragments = None;
        self.settle(outcome);
    }

    fn settle(&self, outcome: SessionOutcome) {
        if self.outcome.set(outcome).is_err() {
            return;
        }
        if let Some(guard) = &self.metrics {
            guard.observe_outcome(outcome.label());
        }
        info!(
            session_id = %self.id,
            outcome = outcome.label(),
            fragments = self.produced,
            "stream session terminated"
        );
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.token.cancel();
        self.fragments = None;
        self.settle(SessionOutcome::Cancelled);
    }
}

/// Live sessions by id, so an out-of-band stop request can reach them.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    live: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl SessionRegistry {
    pub fn register(self: &Arc<Self>, id: Uuid, token: CancellationToken) -> Registration {
        self.lock().insert(id, token);
        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    pub fn stop(&self, id: &Uuid) -> bool {
        match self.lock().get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Registration {
    registry: Arc<SessionRegistry>,
    id: Uuid,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
        debug!(session_id = %self.id, "session deregistered");
    }
}
