/// `error.rs` — bridge error type
///
/// Every error is non-fatal: the node reports it through the host sink and
/// keeps processing the next message.
use std::path::PathBuf;

use thiserror::Error;

use crate::scripting::{diagnostic::ScriptDiagnostic, handles::HandleToken};

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Must specify source file.")]
    MissingScript,

    #[error("Script file '{0}' not found.")]
    ScriptNotFound(String),

    #[error("Error reading '{}': {source}", path.display())]
    ScriptRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Error compiling '{}':\n{diagnostic}", path.display())]
    Compile {
        path: PathBuf,
        diagnostic: ScriptDiagnostic,
    },

    /// Uncaught error in top-level code (`running '<path>'`) or a handler
    /// (`calling '<name>'`).
    #[error("Error {during}:\n{diagnostic}")]
    Runtime {
        during: String,
        diagnostic: ScriptDiagnostic,
    },

    #[error("Function '{0}' does not exist.")]
    UnknownHandler(String),

    #[error("Function '{0}' is private.")]
    PrivateHandler(String),

    #[error("Object token {0} is no longer valid.")]
    StaleHandleToken(HandleToken),

    #[error("No script loaded.")]
    NotLoaded,

    #[error("Error setting property '{name}': {source}")]
    Property {
        name: String,
        #[source]
        source: mlua::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

/// Error categories of the bridge, independent of payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ScriptNotFound,
    CompileError,
    RuntimeError,
    UnknownHandler,
    PrivateHandlerInvocation,
    StaleHandleToken,
    Other,
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::MissingScript | BridgeError::ScriptNotFound(_) | BridgeError::ScriptRead { .. } => {
                ErrorKind::ScriptNotFound
            }
            BridgeError::Compile { .. } => ErrorKind::CompileError,
            BridgeError::Runtime { .. } => ErrorKind::RuntimeError,
            BridgeError::UnknownHandler(_) => ErrorKind::UnknownHandler,
            BridgeError::PrivateHandler(_) => ErrorKind::PrivateHandlerInvocation,
            BridgeError::StaleHandleToken(_) => ErrorKind::StaleHandleToken,
            BridgeError::NotLoaded
            | BridgeError::Property { .. }
            | BridgeError::Config(_)
            | BridgeError::Lua(_) => ErrorKind::Other,
        }
    }
}
