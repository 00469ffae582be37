//! Error types for the client core.

use crate::ber::DecodeError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// LDAP result code as carried in LDAPResult.resultCode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0);
    pub const OPERATIONS_ERROR: ResultCode = ResultCode(1);
    pub const PROTOCOL_ERROR: ResultCode = ResultCode(2);
    pub const COMPARE_FALSE: ResultCode = ResultCode(5);
    pub const COMPARE_TRUE: ResultCode = ResultCode(6);
    pub const AUTH_METHOD_NOT_SUPPORTED: ResultCode = ResultCode(7);
    pub const SASL_BIND_IN_PROGRESS: ResultCode = ResultCode(14);
    pub const NO_SUCH_OBJECT: ResultCode = ResultCode(32);
    pub const INVALID_CREDENTIALS: ResultCode = ResultCode(49);
    pub const UNAVAILABLE: ResultCode = ResultCode(52);
    pub const UNWILLING_TO_PERFORM: ResultCode = ResultCode(53);
    pub const OTHER: ResultCode = ResultCode(80);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "success",
            1 => "operationsError",
            2 => "protocolError",
            5 => "compareFalse",
            6 => "compareTrue",
            7 => "authMethodNotSupported",
            14 => "saslBindInProgress",
            32 => "noSuchObject",
            49 => "invalidCredentials",
            52 => "unavailable",
            53 => "unwillingToPerform",
            80 => "other",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// Why a single failover candidate could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub host: String,
    pub port: u16,
    pub cause: String,
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.host, self.port, self.cause)
    }
}

fn join_failures(failures: &[CandidateFailure]) -> String {
    if failures.is_empty() {
        return "no candidates".to_string();
    }
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum LdapError {
    #[error("BER decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Bind configuration or bind request rejected before anything was sent.
    #[error("parameter error: {0}")]
    BindParameter(String),

    /// Non-bind request, control or filter rejected before anything was sent.
    #[error("invalid request: {0}")]
    Parameter(String),

    #[error("bind failed: {0}")]
    Bind(String),

    #[error("unsupported SASL callback: {0}")]
    UnsupportedCallback(String),

    #[error("server returned {code}: {message}")]
    Result {
        code: ResultCode,
        matched_dn: String,
        message: String,
    },

    #[error("all servers unavailable: {}", join_failures(.0))]
    ServerSetUnavailable(Vec<CandidateFailure>),

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("no pooled connection became available within {0:?}")]
    CheckoutTimeout(Duration),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("health check failed: {0}")]
    HealthCheckFailure(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LdapError {
    /// Errors after which the connection must not be reused.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            LdapError::Io(_)
                | LdapError::ConnectionClosed
                | LdapError::Timeout(_)
                | LdapError::Decode(_)
                | LdapError::Protocol(_)
                | LdapError::Tls(_)
        )
    }

    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            LdapError::Result { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LdapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_display() {
        assert_eq!(ResultCode::NO_SUCH_OBJECT.to_string(), "32 (noSuchObject)");
        assert_eq!(ResultCode(4242).name(), "unknown");
        assert!(ResultCode::SUCCESS.is_success());
    }

    #[test]
    fn test_server_set_unavailable_lists_causes() {
        let err = LdapError::ServerSetUnavailable(vec![
            CandidateFailure {
                host: "ds1".to_string(),
                port: 389,
                cause: "connection refused".to_string(),
            },
            CandidateFailure {
                host: "ds2".to_string(),
                port: 1389,
                cause: "health check failed: no entry".to_string(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("ds1:389: connection refused"));
        assert!(msg.contains("ds2:1389: health check failed"));
    }

    #[test]
    fn test_connection_fatal_classification() {
        assert!(LdapError::ConnectionClosed.is_connection_fatal());
        assert!(!LdapError::PoolExhausted.is_connection_fatal());
        let r = LdapError::Result {
            code: ResultCode::INVALID_CREDENTIALS,
            matched_dn: String::new(),
            message: String::new(),
        };
        assert!(!r.is_connection_fatal());
        assert_eq!(r.result_code(), Some(ResultCode::INVALID_CREDENTIALS));
    }
}
