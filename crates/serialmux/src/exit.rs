use std::fmt;
use std::io;

use serialmux_dispatch::DispatchError;
use serialmux_frame::FrameError;
use serialmux_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(USAGE, message)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::NotFound => USAGE,
        io::ErrorKind::TimedOut => TIMEOUT,
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => DATA_INVALID,
        _ => TRANSPORT_ERROR,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Transport(err) => transport_error(context, err),
        FrameError::AckTimeout { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        FrameError::Crc { .. } | FrameError::LossOfSync | FrameError::Overflow => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

pub fn dispatch_error(context: &str, err: DispatchError) -> CliError {
    match err {
        DispatchError::Frame(err) => frame_error(context, err),
        DispatchError::UnknownFormat(_)
        | DispatchError::FormatReserved(_)
        | DispatchError::FormatInUse(_)
        | DispatchError::LengthOutOfRange { .. }
        | DispatchError::BufferTooSmall { .. } => CliError::usage(format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_errors_keep_their_exit_code() {
        let err = DispatchError::Frame(FrameError::Transport(TransportError::Io(
            io::Error::from(io::ErrorKind::PermissionDenied),
        )));
        assert_eq!(dispatch_error("send", err).code, PERMISSION_DENIED);

        let err = DispatchError::Frame(FrameError::AckTimeout { attempts: 4 });
        let cli = dispatch_error("send", err);
        assert_eq!(cli.code, TIMEOUT);
        assert!(cli.message.starts_with("send: "));
    }

    #[test]
    fn bad_requests_are_usage_errors() {
        let err = DispatchError::LengthOutOfRange {
            format: 0,
            len: 300,
        };
        assert_eq!(dispatch_error("encode", err).code, USAGE);
    }
}
