//! State machine for a single exam attempt.
//!
//! `Initializing -> Active -> Submitting -> Submitted`, with `Failed`
//! reachable when the definition or a session cannot be obtained, or when the
//! server rejects the submission. Submission is guarded by a latch: the first
//! valid `submit()` stores a shared future and every later caller awaits that
//! same future, so timer expiry racing a manual submit yields one remote call.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::clock::{ClockTick, SessionClock, WallClock};
use crate::error::SessionError;
use crate::model::{
    Answer, ExamDefinition, ExamId, Progress, QuestionId, RemoteSessionStatus, SessionId,
    SessionStatus, SubmitReason, SubmitReceipt,
};
use crate::remote::ExamService;
use crate::runtime::{FixedTicker, Periodic, SessionSettings};
use crate::store::AttemptStore;
use crate::sync::{AnswerBook, AnswerSync};
use crate::util::lock;

type SubmissionFuture = Shared<BoxFuture<'static, Result<SubmitReceipt, SessionError>>>;

struct State {
    status: SessionStatus,
    beginning: bool,
    torn_down: bool,
    definition: Option<Arc<ExamDefinition>>,
    session_id: Option<SessionId>,
    clock: Option<SessionClock>,
    sync: Option<AnswerSync>,
    ticker: Option<Periodic>,
    flusher: Option<Periodic>,
    last_error: Option<SessionError>,
}

impl State {
    fn active(&self, operation: &'static str) -> Result<(&ExamDefinition, &AnswerSync), SessionError> {
        match (self.status, self.definition.as_deref(), self.sync.as_ref()) {
            (SessionStatus::Active, Some(definition), Some(sync)) => Ok((definition, sync)),
            (status, ..) => Err(SessionError::InvalidTransition { operation, status }),
        }
    }
}

struct Inner {
    exam_id: ExamId,
    remote: Arc<dyn ExamService>,
    store: AttemptStore,
    wall: Arc<dyn WallClock>,
    settings: SessionSettings,
    state: Mutex<State>,
    submission: Mutex<Option<SubmissionFuture>>,
    status_tx: watch::Sender<SessionStatus>,
    countdown_tx: watch::Sender<Option<u64>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn set_status(&self, state: &mut State, status: SessionStatus) {
        debug!(exam_id = %self.exam_id, from = %state.status, to = %status, "status change");
        state.status = status;
        self.status_tx.send_replace(status);
    }

    fn fail(&self, err: SessionError) -> SessionError {
        error!(exam_id = %self.exam_id, "{err}");
        let mut state = self.state();
        state.last_error = Some(err.clone());
        self.set_status(&mut state, SessionStatus::Failed);
        err
    }

    fn stop_timers(&self, state: &mut State) {
        if let Some(ticker) = state.ticker.take() {
            ticker.stop();
        }
        if let Some(flusher) = state.flusher.take() {
            flusher.stop();
        }
        if let Some(clock) = state.clock.as_mut() {
            clock.stop();
        }
    }

    /// Create a session, or run the single recovery pass when creation fails.
    async fn acquire_session(&self, mirror: Option<&SessionId>) -> Result<SessionId, SessionError> {
        let exam_id = &self.exam_id;
        let create_err = match self.remote.create_session(exam_id).await {
            Ok(session_id) => {
                info!(exam_id = %exam_id, session_id = %session_id, "session created");
                return Ok(session_id);
            }
            Err(e) => e,
        };
        warn!(exam_id = %exam_id, "session create failed, attempting recovery: {create_err}");

        match self.remote.list_sessions(exam_id).await {
            Ok(sessions) => {
                let live: Vec<_> = sessions
                    .into_iter()
                    .filter(|s| s.status == RemoteSessionStatus::InProgress)
                    .collect();
                let chosen = mirror
                    .and_then(|m| live.iter().find(|s| &s.session_id == m))
                    .or_else(|| live.first());
                match chosen {
                    Some(found) => {
                        info!(exam_id = %exam_id, session_id = %found.session_id, "recovered in-progress session");
                        Ok(found.session_id.clone())
                    }
                    None => Err(SessionError::SessionAcquisitionFailed(format!(
                        "{create_err}; no in-progress session to recover"
                    ))),
                }
            }
            Err(list_err) => match mirror {
                Some(mirror) => {
                    warn!(exam_id = %exam_id, session_id = %mirror, "session listing failed, adopting stored session: {list_err}");
                    Ok(mirror.clone())
                }
                None => Err(SessionError::SessionAcquisitionFailed(format!(
                    "{create_err}; recovery failed: {list_err}"
                ))),
            },
        }
    }

    async fn finish_submission(
        self: Arc<Self>,
        reason: SubmitReason,
        session_id: SessionId,
        sync: AnswerSync,
    ) -> Result<SubmitReceipt, SessionError> {
        if let Err(e) = sync.flush_now().await {
            warn!(exam_id = %self.exam_id, "final flush failed, submitting full answer map anyway: {e}");
        }
        let answers = sync.answers();
        let result = self
            .remote
            .submit_session(&session_id, &answers, reason.is_auto())
            .await;

        let mut state = self.state();
        match result {
            Ok(receipt) => {
                if let Err(e) = self.store.erase(&self.exam_id) {
                    error!(exam_id = %self.exam_id, "submitted but local state could not be cleared: {e}");
                }
                self.set_status(&mut state, SessionStatus::Submitted);
                info!(exam_id = %self.exam_id, session_id = %session_id, %reason, "exam submitted");
                Ok(receipt)
            }
            Err(e) => {
                let err = SessionError::SubmissionFailed(e.to_string());
                error!(exam_id = %self.exam_id, session_id = %session_id, %reason, "{err}");
                state.last_error = Some(err.clone());
                self.set_status(&mut state, SessionStatus::Failed);
                Err(err)
            }
        }
    }
}

/// Drives one exam attempt from session acquisition to final submission.
///
/// Cloning yields another handle to the same attempt.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    pub fn new(
        exam_id: ExamId,
        remote: Arc<dyn ExamService>,
        store: AttemptStore,
        wall: Arc<dyn WallClock>,
        settings: SessionSettings,
    ) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Initializing);
        let (countdown_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                exam_id,
                remote,
                store,
                wall,
                settings,
                state: Mutex::new(State {
                    status: SessionStatus::Initializing,
                    beginning: false,
                    torn_down: false,
                    definition: None,
                    session_id: None,
                    clock: None,
                    sync: None,
                    ticker: None,
                    flusher: None,
                    last_error: None,
                }),
                submission: Mutex::new(None),
                status_tx,
                countdown_tx,
            }),
        }
    }

    pub fn exam_id(&self) -> &ExamId {
        &self.inner.exam_id
    }

    /// Fetch the definition, acquire or recover a session, restore persisted
    /// progress and start the countdown and periodic sync.
    pub async fn begin(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        {
            let mut state = inner.state();
            if state.status != SessionStatus::Initializing || state.beginning {
                return Err(SessionError::InvalidTransition {
                    operation: "begin",
                    status: state.status,
                });
            }
            state.beginning = true;
        }
        let exam_id = &inner.exam_id;

        let definition = match inner.remote.fetch_exam_definition(exam_id).await {
            Ok(definition) => Arc::new(definition),
            Err(e) => return Err(inner.fail(SessionError::DefinitionUnavailable(e.to_string()))),
        };

        let persisted = inner.store.load(exam_id).map_err(|e| inner.fail(e.into()))?;

        let session_id = match inner.acquire_session(persisted.session_id.as_ref()).await {
            Ok(session_id) => session_id,
            Err(e) => return Err(inner.fail(e)),
        };

        let started_at_ms = match persisted.started_at_ms {
            Some(started_at_ms) => {
                info!(exam_id = %exam_id, started_at_ms, "resuming attempt");
                started_at_ms
            }
            None => {
                let now = inner.wall.now_ms();
                inner
                    .store
                    .save_started_at(exam_id, now)
                    .map_err(|e| inner.fail(e.into()))?;
                now
            }
        };
        inner
            .store
            .save_session_id(exam_id, &session_id)
            .map_err(|e| inner.fail(e.into()))?;

        let (answers, dropped): (BTreeMap<_, _>, BTreeMap<_, _>) = persisted
            .answers
            .into_iter()
            .partition(|(q, _)| definition.has_question(q));
        if !dropped.is_empty() {
            warn!(exam_id = %exam_id, count = dropped.len(), "ignoring stored answers for unknown questions");
        }
        let flags = persisted
            .flags
            .into_iter()
            .filter(|(q, _)| definition.has_question(q))
            .collect();

        let sync = AnswerSync::new(
            exam_id.clone(),
            session_id.clone(),
            inner.store.clone(),
            inner.remote.clone(),
            AnswerBook::seeded(answers, flags),
        );
        let clock = SessionClock::new(started_at_ms, definition.duration_secs, inner.wall.clone());
        let remaining = clock.remaining_secs();

        let mut state = inner.state();
        state.definition = Some(definition);
        state.session_id = Some(session_id);
        state.clock = Some(clock);
        state.sync = Some(sync);
        inner.set_status(&mut state, SessionStatus::Active);
        if !state.torn_down {
            self.start_timers(&mut state);
        }
        inner.countdown_tx.send_replace(Some(remaining));
        Ok(())
    }

    fn start_timers(&self, state: &mut State) {
        let weak = Arc::downgrade(&self.inner);
        state.ticker = Some(Periodic::spawn(
            FixedTicker::new(self.inner.settings.tick_interval),
            move || {
                let handle = weak.upgrade().map(|inner| SessionCoordinator { inner });
                async move {
                    match handle {
                        Some(coordinator) => coordinator.on_tick(),
                        None => ControlFlow::Break(()),
                    }
                }
            },
        ));

        let weak = Arc::downgrade(&self.inner);
        state.flusher = Some(Periodic::spawn(
            FixedTicker::new(self.inner.settings.flush_interval),
            move || {
                let sync = weak.upgrade().and_then(|inner| {
                    let state = inner.state();
                    state.sync.clone()
                });
                async move {
                    match sync {
                        Some(sync) => {
                            if let Err(e) = sync.flush_now().await {
                                debug!("periodic flush will retry: {e}");
                            }
                            ControlFlow::Continue(())
                        }
                        None => ControlFlow::Break(()),
                    }
                }
            },
        ));
    }

    fn on_tick(&self) -> ControlFlow<()> {
        let tick = {
            let mut state = self.inner.state();
            if state.status != SessionStatus::Active {
                return ControlFlow::Break(());
            }
            match state.clock.as_mut() {
                Some(clock) => clock.tick(),
                None => return ControlFlow::Break(()),
            }
        };

        match tick {
            ClockTick::Running { remaining_secs } => {
                self.inner.countdown_tx.send_replace(Some(remaining_secs));
                ControlFlow::Continue(())
            }
            ClockTick::Expired => {
                self.inner.countdown_tx.send_replace(Some(0));
                info!(exam_id = %self.inner.exam_id, "time expired, auto-submitting");
                let coordinator = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = coordinator.submit(SubmitReason::TimeExpired).await {
                        debug!(exam_id = %coordinator.exam_id(), "auto-submit ended in error: {e}");
                    }
                });
                ControlFlow::Break(())
            }
            ClockTick::Stopped => ControlFlow::Break(()),
        }
    }

    pub fn set_answer(&self, question_id: &str, answer: Answer) -> Result<(), SessionError> {
        let state = self.inner.state();
        let (definition, sync) = state.active("set an answer")?;
        let question = definition
            .question(question_id)
            .ok_or_else(|| SessionError::UnknownQuestion(question_id.to_string()))?;
        if !question.accepts(&answer) {
            return Err(SessionError::InvalidAnswer(question_id.to_string()));
        }
        sync.set_answer(question_id, answer)?;
        Ok(())
    }

    /// Returns whether the question is now flagged for review.
    pub fn toggle_flag(&self, question_id: &str) -> Result<bool, SessionError> {
        let state = self.inner.state();
        let (definition, sync) = state.active("flag a question")?;
        if !definition.has_question(question_id) {
            return Err(SessionError::UnknownQuestion(question_id.to_string()));
        }
        Ok(sync.toggle_flag(question_id)?)
    }

    /// Out-of-band flush of pending answers.
    pub async fn flush_now(&self) -> Result<usize, SessionError> {
        let sync = {
            let state = self.inner.state();
            state.active("sync answers")?.1.clone()
        };
        sync.flush_now().await
    }

    /// Submit the attempt. Only the first call does any work; later calls,
    /// concurrent or not, receive the outcome of that first submission.
    pub async fn submit(&self, reason: SubmitReason) -> Result<SubmitReceipt, SessionError> {
        let pending = {
            let mut slot = lock(&self.inner.submission);
            match slot.as_ref() {
                Some(existing) => {
                    debug!(exam_id = %self.inner.exam_id, %reason, "submission already started");
                    existing.clone()
                }
                None => {
                    let started = self.start_submission(reason)?;
                    *slot = Some(started.clone());
                    started
                }
            }
        };
        pending.await
    }

    fn start_submission(&self, reason: SubmitReason) -> Result<SubmissionFuture, SessionError> {
        let (session_id, sync) = {
            let mut state = self.inner.state();
            let sync = state.active("submit")?.1.clone();
            let session_id = state.session_id.clone().ok_or(SessionError::InvalidTransition {
                operation: "submit",
                status: state.status,
            })?;
            self.inner.stop_timers(&mut state);
            self.inner.set_status(&mut state, SessionStatus::Submitting);
            (session_id, sync)
        };
        info!(exam_id = %self.inner.exam_id, %reason, "submitting exam");

        // its own task, so neither teardown nor a dropped caller cancels it
        let task = tokio::spawn(self.inner.clone().finish_submission(reason, session_id, sync));
        Ok(async move {
            task.await.unwrap_or_else(|e| {
                Err(SessionError::SubmissionFailed(format!(
                    "submission task ended abnormally: {e}"
                )))
            })
        }
        .boxed()
        .shared())
    }

    /// Await the submission if one was started.
    pub async fn outcome(&self) -> Option<Result<SubmitReceipt, SessionError>> {
        let pending = lock(&self.inner.submission).clone();
        match pending {
            Some(pending) => Some(pending.await),
            None => None,
        }
    }

    /// Stop the countdown and periodic sync without ending the attempt.
    /// Persisted state stays so the attempt can be resumed later.
    pub fn teardown(&self) {
        let mut state = self.inner.state();
        state.torn_down = true;
        self.inner.stop_timers(&mut state);
        debug!(exam_id = %self.inner.exam_id, status = %state.status, "coordinator torn down");
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state().status
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.state().session_id.clone()
    }

    pub fn definition(&self) -> Option<Arc<ExamDefinition>> {
        self.inner.state().definition.clone()
    }

    pub fn started_at_ms(&self) -> Option<i64> {
        self.inner.state().clock.as_ref().map(SessionClock::started_at_ms)
    }

    pub fn remaining_secs(&self) -> Option<u64> {
        self.inner.state().clock.as_ref().map(SessionClock::remaining_secs)
    }

    pub fn answers(&self) -> BTreeMap<QuestionId, Answer> {
        let sync = self.inner.state().sync.clone();
        sync.map(|s| s.answers()).unwrap_or_default()
    }

    pub fn flags(&self) -> BTreeMap<QuestionId, bool> {
        let sync = self.inner.state().sync.clone();
        sync.map(|s| s.flags()).unwrap_or_default()
    }

    pub fn pending_sync(&self) -> usize {
        let sync = self.inner.state().sync.clone();
        sync.map(|s| s.pending_count()).unwrap_or(0)
    }

    pub fn progress(&self) -> Option<Progress> {
        let (definition, sync) = {
            let state = self.inner.state();
            (state.definition.clone()?, state.sync.clone()?)
        };
        Some(Progress::from_maps(&definition, &sync.answers(), &sync.flags()))
    }

    pub fn last_error(&self) -> Option<SessionError> {
        self.inner.state().last_error.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Remaining whole seconds, updated every tick while active.
    pub fn subscribe_countdown(&self) -> watch::Receiver<Option<u64>> {
        self.inner.countdown_tx.subscribe()
    }
}
