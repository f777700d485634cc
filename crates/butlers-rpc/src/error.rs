//! RPC error types and the wire mapping.

use jsonrpsee::types::ErrorObjectOwned;
use thiserror::Error;

use butlers_core::{ButlerError, ErrorClass};

/// Application error code used for classified butler failures.
const BUTLER_ERROR_CODE: i32 = -32000;

/// Errors from the RPC layer.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The listener failed to start.
    #[error("server failed to start: {0}")]
    Startup(String),

    /// A client call failed at the transport level.
    #[error("transport: {0}")]
    Transport(String),

    /// A classified butler failure.
    #[error(transparent)]
    Butler(#[from] ButlerError),
}

/// Result type for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Map a classified failure onto the wire.
///
/// The error object carries the class and retryability in `data` so
/// callers can apply retry policy without parsing messages.
#[must_use]
pub fn to_error_object(err: &ButlerError) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(
        BUTLER_ERROR_CODE,
        err.message.clone(),
        Some(serde_json::json!({
            "class": err.class.as_str(),
            "retryable": err.retryable(),
        })),
    )
}

/// Recover a classified failure from a wire error object. Unknown
/// shapes normalize to `internal_error`.
#[must_use]
pub fn from_error_object(err: &ErrorObjectOwned) -> ButlerError {
    let class = err
        .data()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw.get()).ok())
        .and_then(|data| {
            data.get("class")
                .and_then(|c| c.as_str())
                .and_then(ErrorClass::parse)
        });
    match class {
        Some(class) => ButlerError::new(class, err.message()),
        None => ButlerError::internal(err.message()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classified_errors_round_trip_the_wire() {
        let original = ButlerError::overloaded("queue full");
        let wire = to_error_object(&original);
        let back = from_error_object(&wire);
        assert_eq!(back.class, ErrorClass::OverloadRejected);
        assert!(back.retryable());
        assert_eq!(back.message, "queue full");
    }

    #[test]
    fn unknown_wire_errors_become_internal() {
        let wire = ErrorObjectOwned::owned(-32601, "method not found", None::<()>);
        let back = from_error_object(&wire);
        assert_eq!(back.class, ErrorClass::InternalError);
    }
}
