//! Caller verification against the configured user table.

use sha2::{Digest, Sha256};
use tracing::warn;

use shapeshare_core::config::Config;

use crate::CommandError;

/// Identity presented with an instruction.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub token: String,
}

impl Caller {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }
}

/// Constant-time string comparison.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Check the caller's token against `auth.users`, comparing SHA-256 digests.
pub fn verify(config: &Config, caller: &Caller) -> Result<(), CommandError> {
    let Some(user) = config.user(&caller.user_id) else {
        warn!(user_id = %caller.user_id, "Unknown caller");
        return Err(CommandError::Unauthenticated(format!(
            "unknown user '{}'",
            caller.user_id
        )));
    };
    let Some(expected) = user.resolve_token() else {
        warn!(user_id = %caller.user_id, "Caller has no token configured");
        return Err(CommandError::Unauthenticated(format!(
            "no token configured for '{}'",
            caller.user_id
        )));
    };

    let expected_hash = format!("{:x}", Sha256::digest(expected.as_bytes()));
    let provided_hash = format!("{:x}", Sha256::digest(caller.token.as_bytes()));
    if constant_time_eq(&provided_hash, &expected_hash) {
        Ok(())
    } else {
        warn!(user_id = %caller.user_id, "Caller presented an invalid token");
        Err(CommandError::Unauthenticated("invalid token".into()))
    }
}
