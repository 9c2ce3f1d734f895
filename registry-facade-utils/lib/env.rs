//! Utility functions for working with environment variables.
//!
//! Configuration precedence follows the teacher crate's convention: explicit CLI flags win,
//! falling back to these environment variables, falling back to the defaults in [`crate::defaults`].

use std::path::PathBuf;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable for the facade's listen port.
pub const RF_PORT_ENV_VAR: &str = "RF_PORT";

/// Environment variable for the facade's URL path prefix.
pub const RF_PREFIX_ENV_VAR: &str = "RF_PREFIX";

/// Environment variable for the blob store root directory.
pub const RF_STORE_ENV_VAR: &str = "RF_STORE";

/// Environment variable for the remote spec provider's RPC address.
pub const RF_SPEC_PROVIDER_ADDR_ENV_VAR: &str = "RF_SPEC_PROVIDER_ADDR";

/// Environment variable gating the stub authentication challenge.
pub const RF_REQUIRE_AUTH_ENV_VAR: &str = "RF_REQUIRE_AUTH";

/// Environment variable enabling listener handover.
pub const RF_HANDOVER_ENV_VAR: &str = "RF_HANDOVER";

/// Environment variable for the handover socket directory.
pub const RF_HANDOVER_DIR_ENV_VAR: &str = "RF_HANDOVER_DIR";

/// Debug-only path prefix prepended to every on-disk path the facade touches.
pub const RF_ROOT_PREFIX_ENV_VAR: &str = "RF_ROOT_PREFIX";

/// Environment variable for a registry bearer token (upstream credentials, §4.B).
pub const RF_REGISTRY_TOKEN_ENV_VAR: &str = "RF_REGISTRY_TOKEN";

/// Environment variable for a registry basic-auth username (upstream credentials, §4.B).
pub const RF_REGISTRY_USERNAME_ENV_VAR: &str = "RF_REGISTRY_USERNAME";

/// Environment variable for a registry basic-auth password (upstream credentials, §4.B).
pub const RF_REGISTRY_PASSWORD_ENV_VAR: &str = "RF_REGISTRY_PASSWORD";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Applies the debug-only [`RF_ROOT_PREFIX_ENV_VAR`] tunnel to a path, if set.
pub fn apply_root_prefix(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    match std::env::var(RF_ROOT_PREFIX_ENV_VAR) {
        Ok(prefix) if !prefix.is_empty() => PathBuf::from(prefix).join(
            path.strip_prefix("/").unwrap_or(&path),
        ),
        _ => path,
    }
}

/// Returns the registry bearer token from the environment, if set.
pub fn get_registry_token() -> Option<String> {
    std::env::var(RF_REGISTRY_TOKEN_ENV_VAR).ok()
}

/// Returns the registry username from the environment, if set.
pub fn get_registry_username() -> Option<String> {
    std::env::var(RF_REGISTRY_USERNAME_ENV_VAR).ok()
}

/// Returns the registry password from the environment, if set.
pub fn get_registry_password() -> Option<String> {
    std::env::var(RF_REGISTRY_PASSWORD_ENV_VAR).ok()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn apply_root_prefix_noop_when_unset() {
        let _lock = ENV_LOCK.lock().unwrap();
        unsafe { std::env::remove_var(RF_ROOT_PREFIX_ENV_VAR) };
        assert_eq!(apply_root_prefix("/var/lib/x"), PathBuf::from("/var/lib/x"));
    }

    #[test]
    fn apply_root_prefix_prepends_when_set() {
        let _lock = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var(RF_ROOT_PREFIX_ENV_VAR, "/tmp/debug-root") };
        assert_eq!(
            apply_root_prefix("/var/lib/x"),
            PathBuf::from("/tmp/debug-root/var/lib/x")
        );
        unsafe { std::env::remove_var(RF_ROOT_PREFIX_ENV_VAR) };
    }
}
