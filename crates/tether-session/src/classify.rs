//! Decides whether a connection close is worth reconnecting from.

use tether_core::CloseReason;

/// Status code the protocol uses when the linked device was logged out.
pub const LOGGED_OUT_STATUS: u16 = 401;

/// Case-insensitive substrings in a close payload that mean the credentials
/// are no longer accepted.
const PERMANENT_MARKERS: [&str; 3] = ["loggedout", "logout", "forbidden"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseKind {
    /// Credentials are invalid; delete the session.
    Permanent,
    /// Anything else; reconnect with backoff.
    Transient,
}

pub fn classify_close(reason: Option<&CloseReason>) -> CloseKind {
    let Some(reason) = reason else {
        return CloseKind::Transient;
    };
    if reason.status_code == Some(LOGGED_OUT_STATUS) {
        return CloseKind::Permanent;
    }
    let marked = [reason.reason.as_deref(), reason.message.as_deref()]
        .into_iter()
        .flatten()
        .map(str::to_ascii_lowercase)
        .any(|text| PERMANENT_MARKERS.iter().any(|m| text.contains(m)));
    if marked {
        CloseKind::Permanent
    } else {
        CloseKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logged_out_status_is_permanent_regardless_of_payload() {
        let mut reason = CloseReason::status(401);
        assert_eq!(classify_close(Some(&reason)), CloseKind::Permanent);
        reason.reason = Some("restart required".into());
        reason.message = Some("stream errored".into());
        assert_eq!(classify_close(Some(&reason)), CloseKind::Permanent);
    }

    #[test]
    fn markers_match_case_insensitively() {
        for text in ["loggedOut", "LOGOUT", "Forbidden", "device_loggedout_remote"] {
            let reason = CloseReason::with_reason(text);
            assert_eq!(classify_close(Some(&reason)), CloseKind::Permanent, "{text}");
        }
    }

    #[test]
    fn marker_in_message_is_permanent() {
        let reason = CloseReason {
            status_code: Some(403),
            reason: None,
            message: Some("Forbidden by server".into()),
        };
        assert_eq!(classify_close(Some(&reason)), CloseKind::Permanent);
    }

    #[test]
    fn everything_else_is_transient() {
        assert_eq!(classify_close(None), CloseKind::Transient);
        assert_eq!(
            classify_close(Some(&CloseReason::default())),
            CloseKind::Transient
        );
        for code in [408, 428, 440, 500, 503, 515] {
            assert_eq!(
                classify_close(Some(&CloseReason::status(code))),
                CloseKind::Transient,
                "{code}"
            );
        }
        let reason = CloseReason::with_reason("connection lost");
        assert_eq!(classify_close(Some(&reason)), CloseKind::Transient);
    }
}
