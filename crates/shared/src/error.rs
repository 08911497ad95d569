use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("malformed wire message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("wire message is missing required field `{0}`")]
    MissingField(&'static str),
}
