use std::fmt;

/// Status code providers use for a closure caused by the device being
/// unlinked from the account.
pub const LOGGED_OUT_STATUS: u16 = 401;

/// Lifecycle events emitted by a live session, in provider order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A one-time code must be approved out-of-band before the session opens.
    EnrollmentCode(String),
    /// The session is authenticated and usable.
    Open,
    /// The session ended. The handle that emitted this is dead.
    Closed(CloseReason),
    /// New or rotated credentials that must replace the persisted ones.
    CredentialsUpdated(serde_json::Value),
}

/// Why a session closed, as classified by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub status: Option<u16>,
    pub detail: String,
    logged_out: bool,
}

impl CloseReason {
    /// Terminal closure: the identity was revoked, reconnecting is pointless.
    pub fn logged_out(detail: impl Into<String>) -> Self {
        Self {
            status: Some(LOGGED_OUT_STATUS),
            detail: detail.into(),
            logged_out: true,
        }
    }

    /// Any non-terminal closure (network loss, restart required, ...).
    pub fn other(detail: impl Into<String>) -> Self {
        Self {
            status: None,
            detail: detail.into(),
            logged_out: false,
        }
    }

    /// Classify a closure from the provider's status code and explicit flag.
    ///
    /// Only an explicit flag or the logged-out status counts as terminal.
    pub fn classify(status: Option<u16>, detail: impl Into<String>, logged_out: bool) -> Self {
        Self {
            status,
            detail: detail.into(),
            logged_out: logged_out || status == Some(LOGGED_OUT_STATUS),
        }
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {status})", self.detail),
            None => f.write_str(&self.detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(CloseReason::classify(Some(401), "unlinked", false).is_logged_out());
        assert!(CloseReason::classify(None, "revoked", true).is_logged_out());
        assert!(!CloseReason::classify(Some(428), "connection closed", false).is_logged_out());
        assert!(!CloseReason::classify(None, "network-error", false).is_logged_out());
        assert!(!CloseReason::other("stream errored").is_logged_out());
        assert!(CloseReason::logged_out("bye").is_logged_out());
    }

    #[test]
    fn display_includes_status() {
        assert_eq!(
            CloseReason::classify(Some(515), "restart required", false).to_string(),
            "restart required (status 515)"
        );
        assert_eq!(CloseReason::other("gone").to_string(), "gone");
    }
}
