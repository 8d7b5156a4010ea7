use thiserror::Error;

use crate::rpc::RpcError;

/// Crate-level error taxonomy.
///
/// Fatal variants (`Configuration`, `Validation`, `Connection`) abort a run
/// before or at the first remote call. Everything recoverable (batch
/// fallbacks, per-record failures, unresolved references) is handled inside
/// the engine and surfaces through fail records and the report's success
/// flag instead of an `Err`.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Bad operator input detected before any remote call.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Source data does not match the remote schema. Reported with the
    /// complete offending list, never partially.
    #[error("validation error: {0}")]
    Validation(String),

    /// The initial handshake with the remote server failed.
    #[error("connection error: {0}")]
    Connection(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("cache i/o error: {0}")]
    Cache(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}
