use thiserror::Error;

pub type OptimizerResult<T> = Result<T, OptimizerError>;

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Numeric instability: {0}")]
    NumericInstability(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OptimizerError {
    pub fn campaign_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "campaign",
            id: id.to_string(),
        }
    }

    pub fn result_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "optimization result",
            id: id.to_string(),
        }
    }

    pub fn model_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "model",
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<config::ConfigError> for OptimizerError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
