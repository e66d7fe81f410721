use std::io;
use thiserror::Error;

/// Error taxonomy of the proxy core. The variant decides the recovery path:
/// transient backend errors may be retried by the router, permanent backend
/// errors close only the failing backend, client-synthetic errors are turned
/// into an ERR packet while the session continues, everything else tears the
/// session down.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("authentication failed for {user}: {reason}")]
    AuthFail { user: String, reason: String },

    #[error("transient backend error on {backend}: {source}")]
    BackendTransient {
        backend: String,
        #[source]
        source: io::Error,
    },

    #[error("permanent backend error on {backend}: {reason}")]
    BackendPermanent { backend: String, reason: String },

    /// Returned to the client as a synthetic ERR packet, session survives.
    #[error("client error {code} ({sqlstate}): {message}")]
    ClientSynthetic {
        code: u16,
        sqlstate: &'static str,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    pub fn backend_transient(backend: impl Into<String>, source: io::Error) -> Self {
        ProxyError::BackendTransient {
            backend: backend.into(),
            source,
        }
    }

    pub fn backend_permanent(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        ProxyError::BackendPermanent {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Whether the router is allowed to reconnect and retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProxyError::BackendTransient { .. })
    }

    /// Whether only the failing backend should be closed, keeping the session.
    pub fn closes_backend_only(&self) -> bool {
        matches!(
            self,
            ProxyError::BackendTransient { .. } | ProxyError::BackendPermanent { .. }
        )
    }
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_classes() {
        let transient = ProxyError::backend_transient(
            "db-1",
            io::Error::new(io::ErrorKind::TimedOut, "read timeout"),
        );
        assert!(transient.is_transient());
        assert!(transient.closes_backend_only());

        let permanent = ProxyError::backend_permanent("db-2", "history divergence at id 7");
        assert!(!permanent.is_transient());
        assert!(permanent.closes_backend_only());

        let synthetic = ProxyError::ClientSynthetic {
            code: 1792,
            sqlstate: "25006",
            message: "causal read timed out".into(),
        };
        assert!(!synthetic.closes_backend_only());
    }
}
