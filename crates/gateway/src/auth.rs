use std::fmt;

use secrecy::{ExposeSecret, Secret};

// ── Types ────────────────────────────────────────────────────────────────────

/// Resolved shared-secret configuration.
pub struct ResolvedAuth {
    password: Option<Secret<String>>,
}

impl fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedAuth")
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// The server has no password configured.
    MissingConfig,
    /// The caller did not provide one.
    Missing,
    Mismatch,
}

impl AuthFailure {
    pub fn reason(self) -> &'static str {
        match self {
            Self::MissingConfig => "password_missing_config",
            Self::Missing => "password_missing",
            Self::Mismatch => "password_mismatch",
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison (prevents timing attacks).
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    // XOR each byte and accumulate; any difference makes result non-zero.
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

// ── Auth logic ───────────────────────────────────────────────────────────────

/// Resolve auth from the configured password. Blank passwords count as unset.
pub fn resolve_auth(password: Option<String>) -> ResolvedAuth {
    ResolvedAuth {
        password: password.filter(|p| !p.is_empty()).map(Secret::new),
    }
}

impl ResolvedAuth {
    pub fn is_configured(&self) -> bool {
        self.password.is_some()
    }
}

/// Check the password a caller supplied (header or body) against the
/// configured one.
pub fn authorize(auth: &ResolvedAuth, provided: Option<&str>) -> Result<(), AuthFailure> {
    let Some(expected) = auth.password.as_ref() else {
        return Err(AuthFailure::MissingConfig);
    };
    let Some(given) = provided.filter(|p| !p.is_empty()) else {
        return Err(AuthFailure::Missing);
    };
    if !safe_equal(given, expected.expose_secret()) {
        return Err(AuthFailure::Mismatch);
    }
    Ok(())
}
