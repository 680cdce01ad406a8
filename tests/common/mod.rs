// Shared fixtures: a scripted in-memory exam service and a harness that
// builds coordinators over a shared store and a manually driven wall clock.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use exam_session::model::{AnswerEntry, Question, QuestionId, RemoteSession, RemoteSessionStatus};
use exam_session::{
    Answer, AttemptStore, ExamDefinition, ExamId, ExamService, ManualClock, QuestionKind,
    RemoteError, SessionCoordinator, SessionId, SessionSettings, SubmitReceipt,
};

pub const T0: i64 = 1_700_000_000_000;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Fetch,
    Create,
    List,
    Sync(Vec<AnswerEntry>),
    Submit {
        answers: BTreeMap<QuestionId, Answer>,
        auto_submitted: bool,
    },
}

/// What the fake should do on its next calls.
#[derive(Debug, Default)]
pub struct Script {
    pub fail_fetch: bool,
    pub fail_create: bool,
    pub fail_list: bool,
    /// Returned by `list_sessions`.
    pub sessions: Vec<RemoteSession>,
    /// Number of upcoming sync calls that fail.
    pub sync_failures: usize,
    pub fail_submit: bool,
}

pub struct FakeExamService {
    definition: ExamDefinition,
    script: Mutex<Script>,
    calls: Mutex<Vec<Call>>,
    created: Mutex<usize>,
    submit_gate: Mutex<Option<Arc<Semaphore>>>,
}

fn unavailable() -> RemoteError {
    RemoteError::Transport("connection refused".into())
}

impl FakeExamService {
    pub fn new(definition: ExamDefinition) -> Self {
        Self {
            definition,
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
            created: Mutex::new(0),
            submit_gate: Mutex::new(None),
        }
    }

    pub fn script(&self, edit: impl FnOnce(&mut Script)) {
        edit(&mut self.script.lock().unwrap());
    }

    /// Hold submissions until the returned semaphore gets a permit.
    pub fn gate_submissions(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.submit_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn creates(&self) -> usize {
        self.count(|c| matches!(c, Call::Create))
    }

    pub fn syncs(&self) -> Vec<Vec<AnswerEntry>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Sync(batch) => Some(batch),
                _ => None,
            })
            .collect()
    }

    pub fn submits(&self) -> Vec<(BTreeMap<QuestionId, Answer>, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Submit {
                    answers,
                    auto_submitted,
                } => Some((answers, auto_submitted)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ExamService for FakeExamService {
    async fn fetch_exam_definition(&self, _exam_id: &ExamId) -> Result<ExamDefinition, RemoteError> {
        self.record(Call::Fetch);
        if self.script.lock().unwrap().fail_fetch {
            return Err(RemoteError::Status {
                code: 404,
                message: "exam not found".into(),
            });
        }
        Ok(self.definition.clone())
    }

    async fn create_session(&self, _exam_id: &ExamId) -> Result<SessionId, RemoteError> {
        self.record(Call::Create);
        if self.script.lock().unwrap().fail_create {
            return Err(RemoteError::Status {
                code: 409,
                message: "session already in progress".into(),
            });
        }
        let mut created = self.created.lock().unwrap();
        *created += 1;
        Ok(SessionId::new(format!("sess-{created}")))
    }

    async fn list_sessions(&self, _exam_id: &ExamId) -> Result<Vec<RemoteSession>, RemoteError> {
        self.record(Call::List);
        let script = self.script.lock().unwrap();
        if script.fail_list {
            return Err(unavailable());
        }
        Ok(script.sessions.clone())
    }

    async fn sync_answers(&self, _session_id: &SessionId, batch: &[AnswerEntry]) -> Result<(), RemoteError> {
        self.record(Call::Sync(batch.to_vec()));
        let mut script = self.script.lock().unwrap();
        if script.sync_failures > 0 {
            script.sync_failures -= 1;
            return Err(unavailable());
        }
        Ok(())
    }

    async fn submit_session(
        &self,
        _session_id: &SessionId,
        answers: &BTreeMap<QuestionId, Answer>,
        auto_submitted: bool,
    ) -> Result<SubmitReceipt, RemoteError> {
        self.record(Call::Submit {
            answers: answers.clone(),
            auto_submitted,
        });
        let gate = self.submit_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.script.lock().unwrap().fail_submit {
            return Err(RemoteError::Status {
                code: 500,
                message: "grading backend down".into(),
            });
        }
        Ok(SubmitReceipt {
            score: Some(answers.len() as f64),
            total: Some(self.definition.questions.len() as f64),
            passed: Some(true),
            message: None,
        })
    }
}

pub fn in_progress(id: &str) -> RemoteSession {
    RemoteSession {
        session_id: SessionId::new(id),
        status: RemoteSessionStatus::InProgress,
    }
}

pub fn completed(id: &str) -> RemoteSession {
    RemoteSession {
        session_id: SessionId::new(id),
        status: RemoteSessionStatus::Completed,
    }
}

pub fn exam_id() -> ExamId {
    ExamId::parse("examA").unwrap()
}

pub fn definition(duration_secs: u64) -> ExamDefinition {
    ExamDefinition {
        id: exam_id(),
        title: "Ownership basics".into(),
        duration_secs,
        questions: vec![
            Question {
                id: "q1".into(),
                kind: QuestionKind::MultipleChoice,
                prompt: "Which type owns its heap buffer?".into(),
                options: vec!["A".into(), "B".into(), "C".into()],
            },
            Question {
                id: "q2".into(),
                kind: QuestionKind::ShortAnswer,
                prompt: "Name the trait behind `?` conversions.".into(),
                options: vec![],
            },
            Question {
                id: "q3".into(),
                kind: QuestionKind::TrueFalse,
                prompt: "`&mut T` is Copy.".into(),
                options: vec![],
            },
        ],
    }
}

pub fn choice(v: &str) -> Answer {
    Answer::Choice(v.into())
}

/// One store, one remote and one wall clock shared by every coordinator it
/// builds, so dropping a coordinator and building another models a reload.
pub struct Harness {
    pub remote: Arc<FakeExamService>,
    pub store: AttemptStore,
    pub wall: ManualClock,
}

impl Harness {
    pub fn new(duration_secs: u64) -> Self {
        Self {
            remote: Arc::new(FakeExamService::new(definition(duration_secs))),
            store: AttemptStore::in_memory(),
            wall: ManualClock::new(T0),
        }
    }

    pub fn coordinator(&self) -> SessionCoordinator {
        SessionCoordinator::new(
            exam_id(),
            self.remote.clone(),
            self.store.clone(),
            Arc::new(self.wall.clone()),
            SessionSettings::default(),
        )
    }

    pub async fn started(&self) -> SessionCoordinator {
        let coordinator = self.coordinator();
        coordinator.begin().await.unwrap();
        coordinator
    }

    /// Move wall time and tokio time forward together, one second at a time,
    /// then let every woken task run.
    pub async fn elapse(&self, secs: u64) {
        for _ in 0..secs {
            self.wall.advance_secs(1);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        settle().await;
    }
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
