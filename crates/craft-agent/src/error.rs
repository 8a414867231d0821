use craft_process::ServerState;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a lifecycle call was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    AlreadyRunning,
    NotRunning,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::AlreadyRunning => f.write_str("server is already running"),
            Transition::NotRunning => f.write_str("server is not running"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{reason} (state {state:?})")]
    InvalidTransition {
        reason: Transition,
        state: ServerState,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("port {0} is already in use by another instance")]
    PortInUse(u16),

    #[error("invalid schedule {expr:?}: {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("resource counters unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    DownstreamUnavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable machine-readable code forwarded to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::NotFound { .. } => "not_found",
            Error::PortInUse(_) => "port_in_use",
            Error::InvalidSchedule { .. } => "invalid_schedule",
            Error::ResourceUnavailable(_) => "resource_unavailable",
            Error::Io { .. } => "io_failure",
            Error::DownstreamUnavailable(_) => "downstream_unavailable",
            Error::InvalidArgument(_) => "invalid_argument",
        }
    }

    fn hint(&self) -> Option<&'static str> {
        match self {
            Error::InvalidTransition {
                reason: Transition::AlreadyRunning,
                ..
            } => Some("Stop the server first, or use restart."),
            Error::InvalidTransition {
                reason: Transition::NotRunning,
                ..
            } => Some("Start the server first."),
            Error::PortInUse(_) => Some("Pick another port, or leave it empty to auto-assign one."),
            Error::InvalidSchedule { .. } => {
                Some("Use a five-field cron expression, e.g. \"0 */6 * * *\".")
            }
            Error::DownstreamUnavailable(_) => {
                Some("Ensure Java is installed and the server directory contains a launchable server.")
            }
            _ => None,
        }
    }
}

pub(crate) trait IoContext<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|source| Error::Io {
            context: context(),
            source,
        })
    }
}

impl<T> IoContext<T> for serde_json::Result<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| Error::Io {
            context: context(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl From<&Error> for ErrorPayload {
    fn from(err: &Error) -> Self {
        ErrorPayload {
            code: err.code().to_string(),
            message: truncate_utf8(&err.to_string(), MAX_MESSAGE_BYTES),
            hint: err.hint().map(|h| truncate_utf8(h, MAX_HINT_BYTES)),
        }
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

/// JSON envelope for the transport layer.
pub fn encode(err: &Error) -> String {
    serde_json::to_string(&ErrorPayload::from(err))
        .unwrap_or_else(|_| "{\"code\":\"internal\",\"message\":\"serialize_failed\"}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_truncates_message() {
        let err = Error::DownstreamUnavailable("a".repeat(MAX_MESSAGE_BYTES + 1024));
        let s = encode(&err);

        let v: serde_json::Value = serde_json::from_str(&s).unwrap();
        assert_eq!(v.get("code").unwrap(), "downstream_unavailable");
        let msg = v.get("message").unwrap().as_str().unwrap();
        assert!(msg.len() <= MAX_MESSAGE_BYTES);
        assert!(msg.ends_with("…(truncated)"));
        assert!(v.get("hint").is_some());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(100);
        let out = truncate_utf8(&s, 21);
        assert!(out.ends_with("…(truncated)"));
        assert!(out.len() <= 21 + 2);
    }

    #[test]
    fn transition_errors_carry_code_and_hint() {
        let err = Error::InvalidTransition {
            reason: Transition::NotRunning,
            state: ServerState::Stopped,
        };
        assert_eq!(err.code(), "invalid_transition");
        let payload = ErrorPayload::from(&err);
        assert_eq!(payload.hint.as_deref(), Some("Start the server first."));
        assert!(payload.message.contains("not running"));
    }

    #[test]
    fn io_context_wraps_source() {
        let r: std::io::Result<()> = Err(std::io::Error::other("boom"));
        let err = r.io_context(|| "write registry".to_string()).unwrap_err();
        assert_eq!(err.code(), "io_failure");
        assert_eq!(err.to_string(), "write registry: boom");
    }
}
