//! Process environment helpers for tests that exercise `WAGATE_*` overrides.

use std::sync::{Mutex, OnceLock};

/// Every variable `Config::load` reads.
pub(crate) const WAGATE_ENV_KEYS: [&str; 7] = [
    "WAGATE_PORT",
    "WAGATE_API_TOKEN",
    "WAGATE_WEBHOOKS",
    "WAGATE_WEBHOOK_SECRET",
    "WAGATE_SESSION_DIR",
    "WAGATE_BRIDGE_PATH",
    "WAGATE_DB_URL",
];

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Runs `run` holding the env lock, with all `WAGATE_*` overrides cleared
/// before and after.
pub(crate) fn with_locked_env<R>(run: impl FnOnce() -> R) -> R {
    let _guard = env_lock().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    clear_wagate_env();
    let result = run();
    clear_wagate_env();
    result
}

fn clear_wagate_env() {
    for key in WAGATE_ENV_KEYS {
        remove_env_var(key);
    }
}

/// Sets an environment variable. Only call inside `with_locked_env`.
pub(crate) fn set_env_var(key: &str, value: &str) {
    // SAFETY: callers hold the env lock, so no other test thread touches the environment.
    unsafe {
        std::env::set_var(key, value);
    }
}

fn remove_env_var(key: &str) {
    // SAFETY: only reached from `with_locked_env` while the lock is held.
    unsafe {
        std::env::remove_var(key);
    }
}
