use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

pub type QuestionId = String;

/// Identifier of an exam as used in URLs and as the persistence scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExamId(String);

impl ExamId {
    /// Accepts ASCII alphanumerics, `-` and `_`.
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(SessionError::InvalidExamId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session identifier handed out by the remote exam service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "kebab-case")]
pub enum QuestionKind {
    MultipleChoice,
    TrueFalse,
    ShortAnswer,
    Essay,
    Code,
}

/// A single answer value. Persisted tagged so a reload restores the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Answer {
    Choice(String),
    Text(String),
    Code(String),
}

impl Answer {
    /// Builds the answer shape a question of `kind` expects from raw input.
    pub fn for_kind(kind: QuestionKind, raw: impl Into<String>) -> Self {
        match kind {
            QuestionKind::MultipleChoice | QuestionKind::TrueFalse => Answer::Choice(raw.into()),
            QuestionKind::ShortAnswer | QuestionKind::Essay => Answer::Text(raw.into()),
            QuestionKind::Code => Answer::Code(raw.into()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Answer::Choice(v) | Answer::Text(v) | Answer::Code(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub kind: QuestionKind,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl Question {
    /// Options a choice answer is checked against. True/false questions
    /// without explicit options fall back to `True`/`False`.
    pub fn choices(&self) -> Vec<String> {
        if self.options.is_empty() && self.kind == QuestionKind::TrueFalse {
            vec!["True".to_string(), "False".to_string()]
        } else {
            self.options.clone()
        }
    }

    pub fn accepts(&self, answer: &Answer) -> bool {
        match (self.kind, answer) {
            (QuestionKind::MultipleChoice | QuestionKind::TrueFalse, Answer::Choice(value)) => {
                let choices = self.choices();
                choices.is_empty() || choices.iter().any(|c| c == value)
            }
            (QuestionKind::ShortAnswer | QuestionKind::Essay, Answer::Text(_)) => true,
            (QuestionKind::Code, Answer::Code(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamDefinition {
    pub id: ExamId,
    pub title: String,
    pub duration_secs: u64,
    pub questions: Vec<Question>,
}

impl ExamDefinition {
    pub fn question(&self, id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    pub fn has_question(&self, id: &str) -> bool {
        self.question(id).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum SessionStatus {
    Initializing,
    Active,
    Submitting,
    Submitted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum SubmitReason {
    UserRequested,
    TimeExpired,
    Recovered,
}

impl SubmitReason {
    /// Only timer expiry counts as an automatic submission.
    pub fn is_auto(self) -> bool {
        matches!(self, SubmitReason::TimeExpired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteSessionStatus {
    InProgress,
    Completed,
    Abandoned,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSession {
    pub session_id: SessionId,
    pub status: RemoteSessionStatus,
}

/// One element of a sync batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerEntry {
    pub question_id: QuestionId,
    pub answer: Answer,
}

/// What the remote service returns for an accepted submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default, alias = "totalPoints")]
    pub total: Option<f64>,
    #[serde(default)]
    pub passed: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Counts shown next to the countdown while taking an exam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub answered: usize,
    pub flagged: usize,
    pub total: usize,
}

impl Progress {
    pub fn from_maps(
        definition: &ExamDefinition,
        answers: &BTreeMap<QuestionId, Answer>,
        flags: &BTreeMap<QuestionId, bool>,
    ) -> Self {
        Self {
            answered: answers.len(),
            flagged: flags.values().filter(|f| **f).count(),
            total: definition.questions.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(kind: QuestionKind, options: &[&str]) -> Question {
        Question {
            id: "q1".into(),
            kind,
            prompt: "?".into(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    #[test]
    fn exam_id_rejects_unsafe_characters() {
        assert!(ExamId::parse("exam-42_b").is_ok());
        assert!(ExamId::parse("").is_err());
        assert!(ExamId::parse("../etc").is_err());
        assert!(ExamId::parse("a b").is_err());
    }

    #[test]
    fn choice_must_be_a_listed_option() {
        let q = question(QuestionKind::MultipleChoice, &["A", "B"]);
        assert!(q.accepts(&Answer::Choice("B".into())));
        assert!(!q.accepts(&Answer::Choice("C".into())));
        assert!(!q.accepts(&Answer::Text("B".into())));
    }

    #[test]
    fn true_false_defaults_its_options() {
        let q = question(QuestionKind::TrueFalse, &[]);
        assert!(q.accepts(&Answer::Choice("True".into())));
        assert!(!q.accepts(&Answer::Choice("Maybe".into())));
    }

    #[test]
    fn free_text_kinds_take_matching_shapes() {
        assert!(question(QuestionKind::Essay, &[]).accepts(&Answer::Text("..".into())));
        assert!(question(QuestionKind::Code, &[]).accepts(&Answer::Code("fn main(){}".into())));
        assert!(!question(QuestionKind::Code, &[]).accepts(&Answer::Text("x".into())));
    }

    #[test]
    fn answer_for_kind_picks_shape() {
        assert_eq!(
            Answer::for_kind(QuestionKind::TrueFalse, "False"),
            Answer::Choice("False".into())
        );
        assert_eq!(
            Answer::for_kind(QuestionKind::ShortAnswer, "42"),
            Answer::Text("42".into())
        );
    }

    #[test]
    fn only_time_expiry_is_auto() {
        assert!(SubmitReason::TimeExpired.is_auto());
        assert!(!SubmitReason::UserRequested.is_auto());
        assert!(!SubmitReason::Recovered.is_auto());
    }

    #[test]
    fn remote_status_parses_in_progress() {
        let s: RemoteSessionStatus = serde_json::from_str("\"in-progress\"").unwrap();
        assert_eq!(s, RemoteSessionStatus::InProgress);
        let s: RemoteSessionStatus = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(s, RemoteSessionStatus::Unknown);
    }
}
