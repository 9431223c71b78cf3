#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Record has no string \"id\" field")]
    MissingId,
    #[error("Index {index} out of bounds for length {len}")]
    OutOfBounds { index: u32, len: u32 },
}
