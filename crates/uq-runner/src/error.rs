use thiserror::Error;

/// Failure of one pipeline stage or of the cache bookkeeping around it.
///
/// Stage failures are local to a sample and the batch carries on. Consistency
/// and storage failures mean the cache can no longer be trusted and abort the
/// run.
#[derive(Debug, Error)]
pub enum UqError {
    #[error("preprocessing failed: {0}")]
    PreprocessFailed(String),
    #[error("simulation failed: {0}")]
    SimulationFailed(String),
    #[error("postprocessing failed: {0}")]
    PostprocessFailed(String),
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),
    #[error("cache storage failed: {0}")]
    Storage(String),
}

impl UqError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, UqError::ConsistencyViolation(_) | UqError::Storage(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UqError::PreprocessFailed(_) => "preprocess_failed",
            UqError::SimulationFailed(_) => "simulation_failed",
            UqError::PostprocessFailed(_) => "postprocess_failed",
            UqError::ConsistencyViolation(_) => "consistency_violation",
            UqError::Storage(_) => "storage",
        }
    }
}

pub(crate) fn consistency(msg: impl Into<String>) -> UqError {
    UqError::ConsistencyViolation(msg.into())
}
