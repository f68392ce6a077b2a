//! Shared building blocks for the tabrelay workspace.
//!
//! Hosts the identifiers, the controller wire envelopes and the error
//! taxonomy that every other crate wires against.

pub mod ids {
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /// External automation-session identifier, chosen by the controller.
    #[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct SessionId(pub String);

    /// Relay-assigned ordinal for a managed tab.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TabId(pub u64);

    /// Identity of a controller issuing RPC calls, used for rate limiting.
    #[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CallerId(pub String);

    impl SessionId {
        pub fn new(raw: impl Into<String>) -> Self {
            Self(raw.into())
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl CallerId {
        pub fn new(raw: impl Into<String>) -> Self {
            Self(raw.into())
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl fmt::Display for SessionId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl fmt::Display for TabId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl fmt::Display for CallerId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }
}

pub mod wire {
    use super::ids::{SessionId, TabId};
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    /// One controller request. Ids are caller-generated and must stay unique
    /// for the lifetime of the connection.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct RpcEnvelope {
        pub id: String,
        pub verb: String,
        #[serde(default)]
        pub payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub session_id: Option<SessionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tab_id: Option<TabId>,
    }

    /// Response matched back by id; exactly one of `result`/`error` is set.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct RpcResponse {
        pub id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub code: Option<String>,
    }

    impl RpcResponse {
        pub fn ok(id: impl Into<String>, result: Value) -> Self {
            Self {
                id: id.into(),
                result: Some(result),
                error: None,
                code: None,
            }
        }

        pub fn err(id: impl Into<String>, error: impl Into<String>, code: &str) -> Self {
            Self {
                id: id.into(),
                result: None,
                error: Some(error.into()),
                code: Some(code.to_string()),
            }
        }
    }

    /// Lifecycle of a session record, in memory and on disk.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum SessionState {
        Active,
        Orphaned,
        Recovered,
    }

    impl SessionState {
        pub fn as_str(&self) -> &'static str {
            match self {
                SessionState::Active => "active",
                SessionState::Orphaned => "orphaned",
                SessionState::Recovered => "recovered",
            }
        }

        pub fn parse(raw: &str) -> Option<Self> {
            match raw {
                "active" => Some(SessionState::Active),
                "orphaned" => Some(SessionState::Orphaned),
                "recovered" => Some(SessionState::Recovered),
                _ => None,
            }
        }
    }
}

pub mod error {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use thiserror::Error;

    /// High-level error categories surfaced through the RPC `code` field.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Error, Serialize, Deserialize)]
    pub enum RelayErrorKind {
        #[error("connection failure")]
        Connection,
        #[error("invalid request")]
        Validation,
        #[error("deadline exceeded")]
        Timeout,
        #[error("rate limit exceeded")]
        RateLimited,
        #[error("target is busy")]
        Busy,
        #[error("unknown verb")]
        UnknownVerb,
        #[error("expected dialog not present")]
        NoDialog,
        #[error("internal error")]
        Internal,
    }

    impl RelayErrorKind {
        /// Stable wire code for the RPC response envelope.
        pub fn code(&self) -> &'static str {
            match self {
                RelayErrorKind::Connection => "CONNECTION_ERROR",
                RelayErrorKind::Validation => "VALIDATION_ERROR",
                RelayErrorKind::Timeout => "TIMEOUT",
                RelayErrorKind::RateLimited => "RATE_LIMITED",
                RelayErrorKind::Busy => "BUSY",
                RelayErrorKind::UnknownVerb => "UNKNOWN_VERB",
                RelayErrorKind::NoDialog => "NO_DIALOG",
                RelayErrorKind::Internal => "INTERNAL",
            }
        }
    }

    /// Enriched error carried between layers and serialized onto the wire.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct RelayError {
        pub kind: RelayErrorKind,
        pub hint: Option<String>,
        pub retriable: bool,
        pub data: Option<serde_json::Value>,
    }

    impl fmt::Display for RelayError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.kind)?;
            if let Some(hint) = &self.hint {
                write!(f, ": {}", hint)?;
            }
            Ok(())
        }
    }

    impl std::error::Error for RelayError {}

    impl RelayError {
        pub fn new(kind: RelayErrorKind) -> Self {
            Self {
                kind,
                hint: None,
                retriable: false,
                data: None,
            }
        }

        pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
            self.hint = Some(hint.into());
            self
        }

        pub fn retriable(mut self, flag: bool) -> Self {
            self.retriable = flag;
            self
        }

        pub fn with_data(mut self, data: serde_json::Value) -> Self {
            self.data = Some(data);
            self
        }

        pub fn code(&self) -> &'static str {
            self.kind.code()
        }
    }
}

pub use error::{RelayError, RelayErrorKind};
pub use ids::{CallerId, SessionId, TabId};
pub use wire::{RpcEnvelope, RpcResponse, SessionState};
