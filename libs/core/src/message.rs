use std::fmt;

use serde::{Deserialize, Serialize};

/// Correlation id of one call, unique per client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl CallId {
    pub const FIRST: CallId = CallId(1);

    /// The id following this one
    pub fn next(self) -> CallId {
        CallId(self.0.wrapping_add(1))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A `(command, payload)` call on its way to a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request<P> {
    pub id: CallId,
    pub command: String,
    pub payload: P,
}

impl<P> Request<P> {
    pub fn new(id: CallId, command: impl Into<String>, payload: P) -> Self {
        Self {
            id,
            command: command.into(),
            payload,
        }
    }
}

/// What the handler produced for a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome<R> {
    Ok(R),
    Failed(String),
}

impl<R> Outcome<R> {
    pub fn into_result(self) -> std::result::Result<R, String> {
        match self {
            Outcome::Ok(value) => Ok(value),
            Outcome::Failed(message) => Err(message),
        }
    }
}

/// Server answer, tagged with the id of the request it answers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply<R> {
    pub id: CallId,
    pub outcome: Outcome<R>,
}
