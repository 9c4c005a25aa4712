use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Numeric degeneracy: {0}")]
    NumericDegeneracy(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Error, input cannot be empty")]
    EmptyUserInput,

    #[error("Generation aborted")]
    GenerationAborted,

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Reference set error: {0}")]
    Reference(String),
}

impl InferenceError {
    /// Errors that end the current chat turn but leave the session running.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            InferenceError::EmptyUserInput | InferenceError::GenerationAborted
        )
    }
}
