use std::io;

/// Errors surfaced to callers of the public API.
///
/// Per-pair and per-candidate failures inside the resolver or the flow
/// state machine are absorbed locally and never become one of these
/// variants on their own; see the module docs on `dns` and `flow`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed property document or more than one immutable transport")]
    InvalidProperty,

    #[error("DNS resolution completed but yielded no usable addresses")]
    NoResults,

    #[error("DNS resolution timed out before any reply arrived")]
    Timeout,

    #[error("policy manager socket is unavailable")]
    PmUnavailable,

    #[error("operation would block")]
    WouldBlock,

    #[error("internal error: {0}")]
    Internal(&'static str),

    #[error("I/O error")]
    IoError(#[from] io::Error),
}

impl Error {
    /// Whether this error should drive the flow to `on_error` then
    /// `on_close`, as opposed to being returned directly from a call like
    /// `read`/`write` (e.g. `WouldBlock`).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Error::WouldBlock)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
