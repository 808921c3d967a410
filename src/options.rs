//! Process-wide option toggles
//!
//! Each toggle is read from the environment once, on first use, and
//! cached for the life of the process.

use once_cell::sync::Lazy;

fn bool_env(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => value.trim().parse::<i64>().map(|v| v != 0).unwrap_or(default),
        Err(_) => default,
    }
}

/// `ASCEND_LAUNCH_BLOCKING=1` disables asynchronous submission: every
/// kernel launch runs on the producer thread, which makes failures
/// surface at their true call site.
pub fn launch_blocking() -> bool {
    static BLOCKING: Lazy<bool> = Lazy::new(|| bool_env("ASCEND_LAUNCH_BLOCKING", false));
    *BLOCKING
}

/// `TASK_QUEUE_ENABLE=0` turns the submission ring off. Blocking mode
/// implies the queue is off.
pub fn task_queue_enabled() -> bool {
    static ENABLED: Lazy<bool> = Lazy::new(|| bool_env("TASK_QUEUE_ENABLE", true));
    if launch_blocking() {
        return false;
    }
    *ENABLED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_env_parses_integers() {
        // Exercise the parser directly; the cached accessors are
        // process-global and depend on the ambient environment.
        std::env::set_var("NPUFORGE_TEST_BOOL_OPTION", "1");
        assert!(bool_env("NPUFORGE_TEST_BOOL_OPTION", false));
        std::env::set_var("NPUFORGE_TEST_BOOL_OPTION", "0");
        assert!(!bool_env("NPUFORGE_TEST_BOOL_OPTION", true));
        std::env::remove_var("NPUFORGE_TEST_BOOL_OPTION");
        assert!(bool_env("NPUFORGE_TEST_BOOL_OPTION", true));
        assert!(!bool_env("NPUFORGE_TEST_BOOL_OPTION", false));
    }
}
