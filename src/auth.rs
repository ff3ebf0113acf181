// Project authorization
//
// Token transport (header parsing) lives in the transport layer; this module
// only decides whether an already-extracted token may access a project.

use subtle::ConstantTimeEq;

use crate::environment::EnvironmentConfig;
use crate::errors::{ApiError, ErrorCode};

/// Check `token` against the project's allow-list. Comparison is constant
/// time per candidate token.
pub fn authorize_project(env: &EnvironmentConfig, token: &str) -> Result<(), ApiError> {
    if env.tokens.is_empty() {
        return Err(ApiError::new(
            ErrorCode::ConfigInvalid,
            format!("projectId={} has no tokens configured", env.project_id),
            500,
        ));
    }
    let token_bytes = token.as_bytes();
    for allowed in &env.tokens {
        let allowed_bytes = allowed.as_bytes();
        if allowed_bytes.len() == token_bytes.len()
            && bool::from(allowed_bytes.ct_eq(token_bytes))
        {
            return Ok(());
        }
    }
    Err(ApiError::new(
        ErrorCode::Forbidden,
        "token is not allowed to access this environment",
        403,
    ))
}
