use thiserror::Error;

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: std::error::Error + Send + Sync {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are treated like a non-finite log density.
    fn is_recoverable(&self) -> bool;
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Invalid sampler configuration: {0}")]
    InvalidConfig(String),
    #[error("Position does not match the sampler layout: {0}")]
    LayoutMismatch(String),
    #[error("Log density or gradient is not finite at the initial position")]
    NonFiniteInitialPoint,
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, SamplerError>;

impl SamplerError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        SamplerError::InvalidConfig(msg.into())
    }

    pub(crate) fn logp_failure<E: LogpError + 'static>(err: E) -> Self {
        SamplerError::LogpFailure(Box::new(err))
    }
}

/// `Ok(true)` if the log density was evaluated, `Ok(false)` if the
/// evaluation failed with a recoverable error.
pub(crate) fn check_logp<E: LogpError + 'static>(result: std::result::Result<(), E>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.is_recoverable() => {
            log::trace!("recoverable logp error: {}", err);
            Ok(false)
        }
        Err(err) => Err(SamplerError::logp_failure(err)),
    }
}
