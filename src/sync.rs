use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::{SessionError, StoreError};
use crate::model::{Answer, AnswerEntry, ExamId, QuestionId, SessionId};
use crate::remote::ExamService;
use crate::store::AttemptStore;
use crate::util::lock;

/// In-memory answers and flags, with a revision per answered question so a
/// flush knows what the server has not acknowledged yet.
#[derive(Debug, Clone, Default)]
pub struct AnswerBook {
    answers: BTreeMap<QuestionId, Answer>,
    flags: BTreeMap<QuestionId, bool>,
    revisions: BTreeMap<QuestionId, u64>,
    acked: BTreeMap<QuestionId, u64>,
    next_revision: u64,
}

/// A batch taken for one flush, with the revisions it covers.
#[derive(Debug, Clone)]
pub struct PendingBatch {
    pub entries: Vec<AnswerEntry>,
    revisions: Vec<(QuestionId, u64)>,
}

impl AnswerBook {
    /// Seed from persisted maps. Seeded answers are pending: the server may
    /// never have seen them.
    pub fn seeded(answers: BTreeMap<QuestionId, Answer>, flags: BTreeMap<QuestionId, bool>) -> Self {
        let mut book = Self {
            flags,
            ..Self::default()
        };
        for (question_id, answer) in answers {
            book.put_answer(question_id, answer);
        }
        book
    }

    fn put_answer(&mut self, question_id: QuestionId, answer: Answer) {
        self.next_revision += 1;
        self.revisions.insert(question_id.clone(), self.next_revision);
        self.answers.insert(question_id, answer);
    }

    pub fn answers(&self) -> &BTreeMap<QuestionId, Answer> {
        &self.answers
    }

    pub fn flags(&self) -> &BTreeMap<QuestionId, bool> {
        &self.flags
    }

    pub fn is_flagged(&self, question_id: &str) -> bool {
        self.flags.get(question_id).copied().unwrap_or(false)
    }

    pub fn pending(&self) -> PendingBatch {
        let mut entries = Vec::new();
        let mut revisions = Vec::new();
        for (question_id, revision) in &self.revisions {
            if self.acked.get(question_id) < Some(revision) {
                entries.push(AnswerEntry {
                    question_id: question_id.clone(),
                    answer: self.answers[question_id].clone(),
                });
                revisions.push((question_id.clone(), *revision));
            }
        }
        PendingBatch { entries, revisions }
    }

    /// Record a batch as acknowledged. Answers edited after the batch was
    /// taken keep their newer revision and stay pending.
    pub fn acknowledge(&mut self, batch: &PendingBatch) {
        for (question_id, revision) in &batch.revisions {
            let acked = self.acked.entry(question_id.clone()).or_insert(0);
            *acked = (*acked).max(*revision);
        }
    }
}

impl PendingBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

struct SyncInner {
    exam_id: ExamId,
    session_id: SessionId,
    store: AttemptStore,
    remote: Arc<dyn ExamService>,
    book: Mutex<AnswerBook>,
    flushing: tokio::sync::Mutex<()>,
}

/// Keeps answers durable locally and pushes them to the server in batches.
#[derive(Clone)]
pub struct AnswerSync {
    inner: Arc<SyncInner>,
}

impl AnswerSync {
    pub fn new(
        exam_id: ExamId,
        session_id: SessionId,
        store: AttemptStore,
        remote: Arc<dyn ExamService>,
        book: AnswerBook,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                exam_id,
                session_id,
                store,
                remote,
                book: Mutex::new(book),
                flushing: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn book(&self) -> MutexGuard<'_, AnswerBook> {
        lock(&self.inner.book)
    }

    /// Persist first, then update memory. A failed write leaves both untouched.
    pub fn set_answer(&self, question_id: &str, answer: Answer) -> Result<(), StoreError> {
        let mut book = self.book();
        let mut answers = book.answers.clone();
        answers.insert(question_id.to_string(), answer.clone());
        self.inner.store.save_answers(&self.inner.exam_id, &answers)?;
        book.put_answer(question_id.to_string(), answer);
        Ok(())
    }

    /// Returns the new flag state.
    pub fn toggle_flag(&self, question_id: &str) -> Result<bool, StoreError> {
        let mut book = self.book();
        let flagged = !book.is_flagged(question_id);
        let mut flags = book.flags.clone();
        flags.insert(question_id.to_string(), flagged);
        self.inner.store.save_flags(&self.inner.exam_id, &flags)?;
        book.flags = flags;
        Ok(flagged)
    }

    pub fn answers(&self) -> BTreeMap<QuestionId, Answer> {
        self.book().answers.clone()
    }

    pub fn flags(&self) -> BTreeMap<QuestionId, bool> {
        self.book().flags.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.book().pending().len()
    }

    /// Send everything not yet acknowledged. Returns how many answers the
    /// server accepted; zero without a network call when nothing is pending.
    pub async fn flush_now(&self) -> Result<usize, SessionError> {
        let _serial = self.inner.flushing.lock().await;

        let batch = self.book().pending();
        if batch.is_empty() {
            return Ok(0);
        }

        match self
            .inner
            .remote
            .sync_answers(&self.inner.session_id, &batch.entries)
            .await
        {
            Ok(()) => {
                self.book().acknowledge(&batch);
                debug!(exam_id = %self.inner.exam_id, count = batch.len(), "answers synced");
                Ok(batch.len())
            }
            Err(e) => {
                warn!(exam_id = %self.inner.exam_id, session_id = %self.inner.session_id, "bulk sync failed, will retry: {e}");
                Err(SessionError::SyncFailed(e.to_string()))
            }
        }
    }
}
