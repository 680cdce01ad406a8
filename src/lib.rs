// Library surface for the CLI and integration tests.
pub mod app_dirs;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod remote;
pub mod runtime;
pub mod store;
pub mod sync;
pub mod util;

pub use clock::{ManualClock, SessionClock, SystemClock, WallClock};
pub use coordinator::SessionCoordinator;
pub use error::{RemoteError, SessionError, StoreError};
pub use model::{
    Answer, ExamDefinition, ExamId, Question, QuestionKind, SessionId, SessionStatus,
    SubmitReason, SubmitReceipt,
};
pub use remote::{ExamService, HttpExamService};
pub use runtime::SessionSettings;
pub use store::{AttemptStore, SqliteStore};
