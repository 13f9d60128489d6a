use strum::Display;
use thiserror::Error;

/// Process exit codes of `create-template`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    InvalidParameters = 2,
    MissingDependencies = 3,
    InsufficientPermissions = 4,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Errors that map onto a dedicated exit code.
///
/// Everything else travels as a plain [`anyhow::Error`] and exits with
/// [`ExitCode::GeneralError`].
#[derive(Debug, Error)]
pub enum ToolkitError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Missing dependencies: {}", .0.join(", "))]
    MissingDependencies(Vec<String>),
    #[error("Insufficient permissions: {0}")]
    InsufficientPermissions(String),
}

impl ToolkitError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ToolkitError::InvalidParameter(msg.into())
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            ToolkitError::InvalidParameter(_) => ExitCode::InvalidParameters,
            ToolkitError::MissingDependencies(_) => ExitCode::MissingDependencies,
            ToolkitError::InsufficientPermissions(_) => ExitCode::InsufficientPermissions,
        }
    }
}

/// Find the exit code for an error, looking through its whole context chain.
pub fn exit_code_of(err: &anyhow::Error) -> ExitCode {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ToolkitError>())
        .map_or(ExitCode::GeneralError, ToolkitError::exit_code)
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn exit_code_survives_context() {
        let err = Err::<(), _>(ToolkitError::invalid("bad vmid"))
            .context("Failed to load config")
            .unwrap_err();
        assert_eq!(exit_code_of(&err), ExitCode::InvalidParameters);
        assert_eq!(exit_code_of(&err).code(), 2);
    }

    #[test]
    fn plain_errors_are_general() {
        let err = anyhow::anyhow!("qm create failed");
        assert_eq!(exit_code_of(&err), ExitCode::GeneralError);
    }

    #[test]
    fn missing_dependencies_message() {
        let err = ToolkitError::MissingDependencies(vec!["qm".into(), "pvesm".into()]);
        assert_eq!(err.to_string(), "Missing dependencies: qm, pvesm");
        assert_eq!(err.exit_code().code(), 3);
    }
}
