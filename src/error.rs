use crate::engine::EngineError;
use thiserror::Error;

/// Prefix for every output-binding failure message.
pub const OUTPUT_BIND_PREFIX: &str = "failed to use output channel";

const ENGINE_FAILURE_MESSAGE: &str = "measurement engine call failed";
const UNKNOWN_MESSAGE: &str = "unknown error occurred";

/// Failure of a runner invocation.
#[derive(Error, Debug)]
pub enum Error {
    /// The engine failed while creating, configuring or running the session.
    #[error("{0}")]
    Engine(#[from] EngineError),

    /// The caller's output handle could not be bound as a writable stream.
    #[error("failed to use output channel: {0}")]
    OutputBind(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome class of a runner invocation, with stable raw values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    Success = 0,
    EngineFailure = 1,
    OutputBindFailure = 2,
}

impl ResultCode {
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => ResultCode::Success,
            Err(e) => e.code(),
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(ResultCode::Success),
            1 => Some(ResultCode::EngineFailure),
            2 => Some(ResultCode::OutputBindFailure),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl Error {
    pub fn code(&self) -> ResultCode {
        match self {
            Error::Engine(_) => ResultCode::EngineFailure,
            Error::OutputBind(_) => ResultCode::OutputBindFailure,
        }
    }

    /// The captured engine error, if this is an engine failure.
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            Error::Engine(e) => Some(e),
            Error::OutputBind(_) => None,
        }
    }
}

/// Human-readable message for a runner outcome.
///
/// Success yields an empty string. Engine failures carry the engine's own
/// message; binding failures carry [`OUTPUT_BIND_PREFIX`] followed by the OS
/// error seen when the handle was wrapped.
///
/// # Examples
///
/// ```
/// use rperf3_runner::{describe_error, Error};
///
/// let ok: rperf3_runner::Result<()> = Ok(());
/// assert_eq!(describe_error(&ok), "");
///
/// let bind: rperf3_runner::Result<()> = Err(Error::OutputBind(
///     std::io::Error::from_raw_os_error(9),
/// ));
/// assert!(describe_error(&bind).starts_with("failed to use output channel: "));
/// ```
pub fn describe_error<T>(result: &Result<T>) -> String {
    match result {
        Ok(_) => String::new(),
        Err(e) => e.to_string(),
    }
}

/// Message for a raw result code, e.g. one received as a process exit status.
///
/// Without the failing call's error value only the class can be described.
pub fn describe_code(raw: i32) -> String {
    match ResultCode::from_raw(raw) {
        Some(ResultCode::Success) => String::new(),
        Some(ResultCode::EngineFailure) => ENGINE_FAILURE_MESSAGE.to_string(),
        Some(ResultCode::OutputBindFailure) => OUTPUT_BIND_PREFIX.to_string(),
        None => UNKNOWN_MESSAGE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineErrorKind;
    use std::io;

    #[test]
    fn test_describe_success_is_empty() {
        let result: Result<()> = Ok(());
        assert_eq!(describe_error(&result), "");
        assert_eq!(ResultCode::of(&result), ResultCode::Success);
    }

    #[test]
    fn test_describe_engine_failure_uses_engine_message() {
        let engine_err = EngineError::with_detail(EngineErrorKind::Connect, "host unreachable");
        let expected = engine_err.to_string();
        let result: Result<()> = Err(Error::Engine(engine_err));

        assert_eq!(describe_error(&result), expected);
        assert_eq!(ResultCode::of(&result), ResultCode::EngineFailure);
    }

    #[test]
    fn test_describe_bind_failure_has_prefix_and_os_error() {
        let os_err = io::Error::from_raw_os_error(libc::EBADF);
        let os_text = os_err.to_string();
        let result: Result<()> = Err(Error::OutputBind(os_err));

        let msg = describe_error(&result);
        assert!(msg.starts_with(OUTPUT_BIND_PREFIX));
        assert!(msg.contains(&os_text));
        assert_eq!(ResultCode::of(&result), ResultCode::OutputBindFailure);
    }

    #[test]
    fn test_describe_code() {
        assert_eq!(describe_code(0), "");
        assert_eq!(describe_code(1), ENGINE_FAILURE_MESSAGE);
        assert_eq!(describe_code(2), OUTPUT_BIND_PREFIX);
        assert_eq!(describe_code(42), UNKNOWN_MESSAGE);
        assert_eq!(describe_code(-1), UNKNOWN_MESSAGE);
    }

    #[test]
    fn test_raw_codes_are_stable() {
        for code in [
            ResultCode::Success,
            ResultCode::EngineFailure,
            ResultCode::OutputBindFailure,
        ] {
            assert_eq!(ResultCode::from_raw(code.as_raw()), Some(code));
        }
        assert_eq!(ResultCode::EngineFailure.as_raw(), 1);
    }
}
