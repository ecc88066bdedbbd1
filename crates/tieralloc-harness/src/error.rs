use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("allocator: {0}")]
    Alloc(#[from] tieralloc_core::AllocError),
    #[error("scenario {name}: {message}")]
    Scenario { name: &'static str, message: String },
}

impl HarnessError {
    pub(crate) fn scenario(name: &'static str, message: impl Into<String>) -> Self {
        Self::Scenario {
            name,
            message: message.into(),
        }
    }
}
