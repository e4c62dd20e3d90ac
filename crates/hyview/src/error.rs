//! Error taxonomy shared by the requester and the host.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::c4::C4Error;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Broad class of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input rejected at the call site.
    Validation,
    /// The operation is not allowed in the current session state.
    State,
    /// The channel to the peer failed.
    Transport,
    /// A value could not be hashed.
    Hashing,
    /// The peer's handler failed and replied with a fault.
    Remote,
    /// A plugin could not be located or loaded.
    Plugin,
    /// Bad configuration.
    Config,
    /// Local IO failure.
    Io,
    /// Payload (de)serialization failure.
    Serialization,
}

impl ErrorKind {
    /// Stable name used as the fault kind on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "Validation",
            ErrorKind::State => "State",
            ErrorKind::Transport => "Transport",
            ErrorKind::Hashing => "Hashing",
            ErrorKind::Remote => "Remote",
            ErrorKind::Plugin => "Plugin",
            ErrorKind::Config => "Config",
            ErrorKind::Io => "Io",
            ErrorKind::Serialization => "Serialization",
        }
    }
}

/// Errors produced by hyview.
#[derive(Debug, Error)]
pub enum Error {
    /// Session names must be usable as host node names.
    #[error("invalid name {0:?}: names must be non-empty and start with an ASCII letter")]
    InvalidName(String),
    /// Geometry that cannot be named or sent as is.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    /// Attribute domain outside the four supported ones.
    #[error("unknown attribute domain {0:?}; expected one of Global, Point, Prim, Vertex")]
    UnknownDomain(String),
    /// Method names form a single namespace.
    #[error("{0:?} is already a registered method name")]
    DuplicateMethod(String),
    /// A method was called with arguments it cannot use.
    #[error("invalid arguments for {method}: {message}")]
    InvalidArguments {
        /// Method being called.
        method: String,
        /// What was wrong.
        message: String,
    },
    /// Another build holds the session slot.
    #[error("build {0:?} is still active")]
    BuildActive(String),
    /// The host already has a session with this name.
    #[error("{0:?} already exists on the host")]
    DuplicateBuild(String),
    /// The host has no node with this name.
    #[error("no node named {0:?}")]
    UnknownNode(String),
    /// A session accessor was used with no build in flight.
    #[error("no active build")]
    NoActiveBuild,
    /// The host signalled completion before draining the geometry streams.
    #[error("build {name:?} completed before {message}")]
    ContractViolation {
        /// Session name.
        name: String,
        /// What was still pending.
        message: String,
    },
    /// The connection to the peer failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// Identifier generation failed.
    #[error(transparent)]
    Hash(#[from] C4Error),
    /// The peer replied with a fault.
    #[error("remote fault: {0}")]
    Remote(Fault),
    /// Plugin discovery or loading failed.
    #[error("plugin error: {0}")]
    Plugin(String),
    /// Configuration could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON payload error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidName(_)
            | Error::InvalidGeometry(_)
            | Error::UnknownDomain(_)
            | Error::DuplicateMethod(_)
            | Error::InvalidArguments { .. } => ErrorKind::Validation,
            Error::BuildActive(_)
            | Error::DuplicateBuild(_)
            | Error::UnknownNode(_)
            | Error::NoActiveBuild
            | Error::ContractViolation { .. } => ErrorKind::State,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Hash(_) => ErrorKind::Hashing,
            Error::Remote(_) => ErrorKind::Remote,
            Error::Plugin(_) => ErrorKind::Plugin,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_) => ErrorKind::Serialization,
        }
    }

    /// Whether the channel to the peer failed.
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// Shorthand for [`Error::InvalidArguments`].
    pub fn invalid_arguments(method: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::InvalidArguments {
            method: method.into(),
            message: message.to_string(),
        }
    }
}

/// Structured application error carried in a reply instead of a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Error class, e.g. `Validation` or `UnknownMethod`.
    pub kind: String,
    /// Human readable message.
    pub message: String,
}

impl Fault {
    /// Kind used when no handler is registered under a name.
    pub const UNKNOWN_METHOD: &'static str = "UnknownMethod";
    /// Kind used when a unary method is streamed or a streaming one is called.
    pub const WRONG_SHAPE: &'static str = "WrongShape";
    /// Kind used when the host gave up materializing a build.
    pub const ABORTED: &'static str = "Aborted";

    /// Create a fault.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<Error> for Fault {
    fn from(err: Error) -> Self {
        match err {
            Error::Remote(fault) => fault,
            other => Fault::new(other.kind().as_str(), other.to_string()),
        }
    }
}
