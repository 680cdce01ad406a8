use directories::ProjectDirs;
use std::path::PathBuf;

/// Centralized application directory resolution
pub struct AppDirs;

impl AppDirs {
    /// Where attempt state is kept between runs.
    pub fn db_path() -> Option<PathBuf> {
        if let Ok(home) = std::env::var("HOME") {
            let state_dir = PathBuf::from(home)
                .join(".local")
                .join("state")
                .join("exam-session");
            Some(state_dir.join("sessions.db"))
        } else {
            ProjectDirs::from("", "", "exam-session")
                .map(|proj_dirs| proj_dirs.data_local_dir().join("sessions.db"))
        }
    }
}
