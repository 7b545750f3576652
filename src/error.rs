//! Crate-wide error type.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// No credential source resolved for an agent address.
    #[error("no auth method can be applied to agent")]
    NoAuthMethod,

    #[error("match rule kind `{0}` is not registered")]
    UnknownRuleKind(String),

    #[error("bad match pattern `{pattern}`: {reason}")]
    BadPattern { pattern: String, reason: String },

    #[error("invalid private key: {0}")]
    KeyParseFailed(String),

    #[error("dial {addr} failed: {reason}")]
    DialFailed { addr: String, reason: String },

    #[error("handshake with {addr} failed: {reason}")]
    HandshakeFailed { addr: String, reason: String },

    #[error("mux has been closed")]
    MuxClosed,

    #[error("connection closed")]
    ConnClosed,

    /// The server refused to honour a session channel. Internal: the exec
    /// path consumes this and retries on a fresh ticket.
    #[error("session channel prohibited by server")]
    SessionProhibited,

    #[error("destination is directory")]
    DestIsDirectory,

    #[error("{0}: no such file or directory")]
    NotFound(String),

    #[error("{0}: file already exists")]
    AlreadyExists(String),

    #[error("{0}: permission denied")]
    PermissionDenied(String),

    #[error("path `{0}` is not absolute")]
    PathNotAbsolute(String),

    #[error("cannot make {target} relative to {base}")]
    CannotRelativise { base: String, target: String },

    /// Non-zero exit from a remote or local command. `output` holds the
    /// combined stdout/stderr captured up to the failure.
    #[error("command exited with status {status}")]
    CommandFailed { status: u32, output: Vec<u8> },

    #[error("operation not supported on this platform: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Sftp(#[from] russh_sftp::client::error::Error),
}

impl Error {
    /// True for the open-channel rejection that the exec path retries on.
    pub(crate) fn is_session_prohibited(&self) -> bool {
        match self {
            Error::SessionProhibited => true,
            Error::Ssh(russh::Error::ChannelOpenFailure(reason)) => matches!(
                reason,
                russh::ChannelOpenFailure::AdministrativelyProhibited
            ),
            _ => false,
        }
    }

    pub(crate) fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            Error::Io(e) => Some(e.kind()),
            _ => None,
        }
    }

    /// SFTP status code carried by this error, if it wraps one.
    pub(crate) fn sftp_status(&self) -> Option<russh_sftp::protocol::StatusCode> {
        match self {
            Error::Sftp(russh_sftp::client::error::Error::Status(status)) => {
                Some(status.status_code)
            }
            _ => None,
        }
    }
}
