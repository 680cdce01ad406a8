use std::sync::{Mutex, MutexGuard};

/// `HH:MM:SS`, the way the exam header shows the countdown.
pub fn format_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{secs:02}")
}

/// Lock ignoring poisoning; guarded state stays consistent because no
/// guard is held across a fallible step that could leave it half-written.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
