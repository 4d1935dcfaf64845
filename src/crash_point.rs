//! Crash point injection for durability testing
//!
//! Setting `EGM_STORAGE_CRASH_POINT` to one of the names in [`points`] makes
//! the process abort the moment execution reaches that point: no cleanup,
//! no unwinding, no catching. A reopened store must then show either all or
//! none of the interrupted operation.
//!
//! ```bash
//! EGM_STORAGE_CRASH_POINT=commit_before egm-storage clear --level static
//! ```
//!
//! A harness that must get past start-up first (opening a store commits)
//! can instead [`arm`] a point once the process is where it wants it.

use std::sync::OnceLock;

/// Environment variable selecting the crash point
pub const CRASH_POINT_ENV: &str = "EGM_STORAGE_CRASH_POINT";

static CRASH_POINT: OnceLock<Option<String>> = OnceLock::new();
static ARMED: OnceLock<String> = OnceLock::new();

#[inline]
fn configured() -> Option<&'static str> {
    CRASH_POINT
        .get_or_init(|| std::env::var(CRASH_POINT_ENV).ok())
        .as_deref()
}

/// Arm `name` from code. Only the first call takes effect.
///
/// Returns false if another point was armed already.
pub fn arm(name: &str) -> bool {
    ARMED.get_or_init(|| name.to_string()) == name
}

/// True when `name` is the configured or armed crash point
#[inline]
pub fn crash_point_enabled(name: &str) -> bool {
    configured() == Some(name) || ARMED.get().map(String::as_str) == Some(name)
}

/// Abort the process if `name` is the configured crash point
#[inline]
pub fn maybe_crash(name: &str) {
    if crash_point_enabled(name) {
        eprintln!("[CRASH] Triggering crash at point: {}", name);
        std::process::abort();
    }
}

/// Defined crash points
pub mod points {
    // Transactions
    pub const COMMIT_BEFORE: &str = "commit_before";
    pub const COMMIT_AFTER: &str = "commit_after";

    // Clear
    pub const CLEAR_BEFORE_COMMIT: &str = "clear_before_commit";
    pub const CLEAR_AFTER_DELETE: &str = "clear_after_delete";

    // Mirror repair
    pub const MIRROR_BEFORE_COPY: &str = "mirror_before_copy";
    pub const MIRROR_BEFORE_RENAME: &str = "mirror_before_rename";

    pub fn all() -> &'static [&'static str] {
        &[
            COMMIT_BEFORE,
            COMMIT_AFTER,
            CLEAR_BEFORE_COMMIT,
            CLEAR_AFTER_DELETE,
            MIRROR_BEFORE_COPY,
            MIRROR_BEFORE_RENAME,
        ]
    }
}
