//! The user state machine seam.
//!
//! Committed entries are pushed through [`StateMachine::apply`] in strict
//! index order; queries read from applied state. Apply failures become
//! `Application` error responses and never stop the log.

use std::fmt;

use bytes::Bytes;
use copycat_log::Entry;

/// An error raised by the user state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyError {
    /// Description of the failure.
    pub message: String,
}

impl ApplyError {
    /// Creates an apply error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "apply error: {}", self.message)
    }
}

impl std::error::Error for ApplyError {}

/// The replicated state machine commit callback.
///
/// `apply` is invoked exactly once per committed command entry, in index
/// order, on the context's executor thread. `query` reads from applied
/// state without mutating it.
pub trait StateMachine: Send + 'static {
    /// Applies a committed command entry and returns its result.
    ///
    /// # Errors
    /// Returns an error if the command is rejected; the entry remains
    /// committed and the log continues.
    fn apply(&mut self, entry: &Entry) -> Result<Bytes, ApplyError>;

    /// Serves a query from applied state.
    ///
    /// # Errors
    /// Returns an error if the query is rejected.
    fn query(&self, key: &Bytes, payload: &Bytes) -> Result<Bytes, ApplyError>;
}
