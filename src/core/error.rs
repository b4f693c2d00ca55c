use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("insufficient history: {available} months available, {required} needed for one cycle")]
    InsufficientHistory { available: usize, required: usize },

    #[error("historical series are misaligned: {0}")]
    DataAlignment(String),

    #[error("invalid stage sequence: {0}")]
    InvalidStageSequence(String),

    #[error("invalid withdrawal scheme parameter: {0}")]
    InvalidSchemeParameter(String),

    #[error("invalid initial portfolio: {0}")]
    InvalidPortfolio(String),

    #[error("invalid planning horizon: {0}")]
    InvalidHorizon(String),

    #[error("invalid aggregation settings: {0}")]
    InvalidAggregation(String),

    #[error("request superseded by a newer one")]
    Superseded,

    #[error("simulation worker failed: {0}")]
    WorkerFailed(String),
}

impl EngineError {
    pub fn is_configuration_error(&self) -> bool {
        !matches!(self, EngineError::Superseded | EngineError::WorkerFailed(_))
    }
}
