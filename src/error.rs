pub type MontageResult<T> = Result<T, MontageError>;

#[derive(thiserror::Error, Debug)]
pub enum MontageError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("animation error: {0}")]
    Animation(String),

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("media error: {0}")]
    Media(String),

    /// Transient decode failure (keyframe required, flush mid-GOP). Callers may
    /// retry from an earlier timestamp before treating the source as failed.
    #[error("recoverable decode error: {0}")]
    DecodeRecoverable(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("render cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MontageError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn animation(msg: impl Into<String>) -> Self {
        Self::Animation(msg.into())
    }

    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation(msg.into())
    }

    pub fn media(msg: impl Into<String>) -> Self {
        Self::Media(msg.into())
    }

    pub fn decode_recoverable(msg: impl Into<String>) -> Self {
        Self::DecodeRecoverable(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    pub fn encoder(msg: impl Into<String>) -> Self {
        Self::Encoder(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
