use thiserror::Error;

pub type AnalysisResult<T> = Result<T, AnalysisError>;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// A rollup names a query shape that has no slow query behind it.
    #[error("no slow query found for query shape {hash}")]
    Consistency { hash: String },
    #[error("backend error: {0}")]
    Backend(String),
}

impl AnalysisError {
    pub fn consistency(hash: impl Into<String>) -> Self {
        Self::Consistency { hash: hash.into() }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}
