use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::RemoteError;
use crate::model::{
    Answer, AnswerEntry, ExamDefinition, ExamId, Question, QuestionId, QuestionKind,
    RemoteSession, RemoteSessionStatus, SessionId, SubmitReceipt,
};

/// Minutes assumed when the exam payload carries no time limit.
const DEFAULT_DURATION_MINUTES: u64 = 60;

/// Remote exam service consumed by the coordinator.
#[async_trait]
pub trait ExamService: Send + Sync + 'static {
    async fn fetch_exam_definition(&self, exam_id: &ExamId) -> Result<ExamDefinition, RemoteError>;

    async fn create_session(&self, exam_id: &ExamId) -> Result<SessionId, RemoteError>;

    async fn list_sessions(&self, exam_id: &ExamId) -> Result<Vec<RemoteSession>, RemoteError>;

    /// Last-write-wins upsert of a batch of answers.
    async fn sync_answers(&self, session_id: &SessionId, batch: &[AnswerEntry])
        -> Result<(), RemoteError>;

    async fn submit_session(
        &self,
        session_id: &SessionId,
        answers: &BTreeMap<QuestionId, Answer>,
        auto_submitted: bool,
    ) -> Result<SubmitReceipt, RemoteError>;
}

/// Responses come either bare or wrapped as `{success, data, message}`.
fn unwrap_envelope<T: DeserializeOwned>(body: Value) -> Result<T, RemoteError> {
    let payload = match body {
        Value::Object(mut map) if map.contains_key("success") => {
            if !map.get("success").and_then(Value::as_bool).unwrap_or(false) {
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("request rejected");
                return Err(RemoteError::Rejected(message.to_string()));
            }
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(payload).map_err(|e| RemoteError::Decode(e.to_string()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExamPayload {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    time_limit: Option<u64>,
    #[serde(default)]
    duration: Option<u64>,
    #[serde(default)]
    questions: Vec<QuestionPayload>,
}

#[derive(Deserialize)]
struct QuestionPayload {
    #[serde(alias = "_id")]
    id: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default, alias = "question", alias = "text")]
    prompt: String,
    #[serde(default)]
    options: Vec<OptionPayload>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OptionPayload {
    Plain(String),
    Labeled { text: String },
}

impl OptionPayload {
    fn into_text(self) -> String {
        match self {
            OptionPayload::Plain(text) | OptionPayload::Labeled { text } => text,
        }
    }
}

impl QuestionPayload {
    fn into_question(self) -> Question {
        let options: Vec<String> = self.options.into_iter().map(OptionPayload::into_text).collect();
        let kind = match self.kind.as_deref() {
            Some("multiple-choice") | Some("mcq") => QuestionKind::MultipleChoice,
            Some("true-false") => QuestionKind::TrueFalse,
            Some("short-answer") => QuestionKind::ShortAnswer,
            Some("essay") => QuestionKind::Essay,
            Some("code") => QuestionKind::Code,
            _ if !options.is_empty() => QuestionKind::MultipleChoice,
            _ => QuestionKind::ShortAnswer,
        };
        Question {
            id: self.id,
            kind,
            prompt: self.prompt,
            options,
        }
    }
}

impl ExamPayload {
    fn into_definition(self, exam_id: &ExamId) -> Result<ExamDefinition, RemoteError> {
        let minutes = self
            .time_limit
            .or(self.duration)
            .unwrap_or(DEFAULT_DURATION_MINUTES);
        let duration_secs = minutes
            .checked_mul(60)
            .ok_or_else(|| RemoteError::Decode("time limit out of range".to_string()))?;
        Ok(ExamDefinition {
            id: exam_id.clone(),
            title: self.title.unwrap_or_else(|| exam_id.to_string()),
            duration_secs,
            questions: self
                .questions
                .into_iter()
                .map(QuestionPayload::into_question)
                .collect(),
        })
    }
}

#[derive(Deserialize)]
struct CreatedSession {
    #[serde(alias = "_id", alias = "sessionId")]
    id: String,
}

#[derive(Deserialize)]
struct SessionPayload {
    #[serde(alias = "_id", alias = "sessionId")]
    id: String,
    status: RemoteSessionStatus,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SessionList {
    Wrapped { sessions: Vec<SessionPayload> },
    List(Vec<SessionPayload>),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncItem<'a> {
    question_id: &'a str,
    answer: &'a str,
    time_spent: u64,
}

#[derive(Serialize)]
struct SyncBody<'a> {
    answers: Vec<SyncItem<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody<'a> {
    answers: BTreeMap<&'a str, &'a str>,
    auto_submitted: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default, alias = "error")]
    message: Option<String>,
}

/// REST client for the exam portal API.
#[derive(Debug, Clone)]
pub struct HttpExamService {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpExamService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Body of a 2xx response; any other status is an error.
    async fn fetch(&self, builder: RequestBuilder) -> Result<String, RemoteError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response.text().await.unwrap_or_default()));
        }
        Ok(response.text().await?)
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, RemoteError> {
        let body = self.fetch(builder).await?;
        let value = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body).map_err(|e| RemoteError::Decode(e.to_string()))?
        };
        unwrap_envelope(value)
    }
}

fn status_error(status: StatusCode, body: String) -> RemoteError {
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    RemoteError::Status {
        code: status.as_u16(),
        message,
    }
}

/// Best-effort receipt from an accepted submission. An explicit
/// `success: false` is still a rejection; anything unreadable yields an
/// empty receipt.
fn read_receipt(session_id: &SessionId, body: &str) -> Result<SubmitReceipt, RemoteError> {
    if body.trim().is_empty() {
        return Ok(SubmitReceipt::default());
    }
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            warn!(session_id = %session_id, "submission accepted with a non-JSON body: {e}");
            return Ok(SubmitReceipt::default());
        }
    };
    match unwrap_envelope::<Option<SubmitReceipt>>(value) {
        Ok(receipt) => Ok(receipt.unwrap_or_default()),
        Err(RemoteError::Decode(e)) => {
            warn!(session_id = %session_id, "submission accepted with an unreadable receipt: {e}");
            Ok(SubmitReceipt::default())
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl ExamService for HttpExamService {
    async fn fetch_exam_definition(&self, exam_id: &ExamId) -> Result<ExamDefinition, RemoteError> {
        let body: Value = self
            .send(self.request(Method::GET, &format!("/api/exams/{exam_id}")))
            .await?;
        // the session endpoint nests the exam under `exam`
        let body = match body {
            Value::Object(mut map) if map.contains_key("exam") => {
                map.remove("exam").unwrap_or(Value::Null)
            }
            other => other,
        };
        let payload: ExamPayload =
            serde_json::from_value(body).map_err(|e| RemoteError::Decode(e.to_string()))?;
        payload.into_definition(exam_id)
    }

    async fn create_session(&self, exam_id: &ExamId) -> Result<SessionId, RemoteError> {
        let created: CreatedSession = self
            .send(
                self.request(Method::POST, &format!("/api/exams/{exam_id}/start"))
                    .json(&serde_json::json!({ "examId": exam_id })),
            )
            .await?;
        Ok(SessionId::new(created.id))
    }

    async fn list_sessions(&self, exam_id: &ExamId) -> Result<Vec<RemoteSession>, RemoteError> {
        let list: SessionList = self
            .send(self.request(Method::GET, &format!("/api/exams/{exam_id}/sessions")))
            .await?;
        let sessions = match list {
            SessionList::Wrapped { sessions } | SessionList::List(sessions) => sessions,
        };
        Ok(sessions
            .into_iter()
            .map(|s| RemoteSession {
                session_id: SessionId::new(s.id),
                status: s.status,
            })
            .collect())
    }

    async fn sync_answers(
        &self,
        session_id: &SessionId,
        batch: &[AnswerEntry],
    ) -> Result<(), RemoteError> {
        let body = SyncBody {
            answers: batch
                .iter()
                .map(|e| SyncItem {
                    question_id: &e.question_id,
                    answer: e.answer.as_str(),
                    time_spent: 0,
                })
                .collect(),
        };
        let _: Value = self
            .send(
                self.request(Method::POST, &format!("/api/sessions/{session_id}/answers"))
                    .json(&body),
            )
            .await?;
        Ok(())
    }

    async fn submit_session(
        &self,
        session_id: &SessionId,
        answers: &BTreeMap<QuestionId, Answer>,
        auto_submitted: bool,
    ) -> Result<SubmitReceipt, RemoteError> {
        let body = SubmitBody {
            answers: answers
                .iter()
                .map(|(q, a)| (q.as_str(), a.as_str()))
                .collect(),
            auto_submitted,
        };
        let body = self
            .fetch(
                self.request(Method::POST, &format!("/api/sessions/{session_id}/submit"))
                    .json(&body),
            )
            .await?;
        // a 2xx means the attempt is graded; only an explicit rejection fails it
        read_receipt(session_id, &body)
    }
}
