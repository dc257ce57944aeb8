use datapub_core::CoreError;
use datapub_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::NotFound(_) => 404,
            EngineError::BadRequest(_) => 400,
            EngineError::Forbidden(_) => 403,
            EngineError::Storage(_) | EngineError::Core(_) | EngineError::Internal(_) => 500,
        }
    }
}

/// Uniform failure shape returned by the operations layer: an HTTP status, an
/// opaque per-call-site source tag for support tickets, and the message.
/// `thiserror` reserves the name `source` for the cause chain, hence
/// `source_tag`.
#[derive(Debug, Error)]
#[error("{message} (status {status}, source 0x{source_tag:08x})")]
pub struct ApiError {
    pub status: u16,
    pub source_tag: u32,
    pub message: String,
}

impl ApiError {
    pub fn tag(source_tag: u32, err: EngineError) -> Self {
        Self {
            status: err.status_code(),
            source_tag,
            message: err.to_string(),
        }
    }
}

pub(crate) trait Tagged<T> {
    fn source(self, tag: u32) -> Result<T, ApiError>;
}

impl<T, E: Into<EngineError>> Tagged<T> for Result<T, E> {
    fn source(self, tag: u32) -> Result<T, ApiError> {
        self.map_err(|e| ApiError::tag(tag, e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_carries_status_and_tag() {
        let err = ApiError::tag(0x6aff_0001, EngineError::NotFound("record x".into()));
        assert_eq!(err.status, 404);
        assert_eq!(err.source_tag, 0x6aff_0001);
        let rendered = err.to_string();
        assert!(rendered.contains("record x"));
        assert!(rendered.contains("source 0x6aff0001"));
    }
}
