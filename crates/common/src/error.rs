//! Error types shared across Reelout crates.

use std::fmt;
use std::path::PathBuf;

/// Setup step of an encoder/muxer that can fail while a writer is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderSetupStep {
    Stream,
    CodecContext,
    FrameBuffers,
    MuxerIo,
    Header,
}

impl EncoderSetupStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::CodecContext => "codec context",
            Self::FrameBuffers => "frame buffers",
            Self::MuxerIo => "muxer I/O",
            Self::Header => "header",
        }
    }
}

impl fmt::Display for EncoderSetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for Reelout operations.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// A config is not legal for the format it was used with.
    #[error("Configuration violation: {message}")]
    Configuration { message: String },

    /// One ranked encoder setting failed to open. Recoverable by falling back.
    #[error("Failed to open encoder '{codec}' at step '{step}': {message}")]
    EncoderOpen {
        codec: String,
        step: EncoderSetupStep,
        message: String,
    },

    /// The encoder failed after it was opened. Never retried.
    #[error("Encoder stream error: {message}")]
    EncoderStream { message: String },

    #[error("Frame source error: {message}")]
    Source { message: String },

    #[error("Image encoding error: {message}")]
    Image { message: String },

    #[error("Render job was cancelled")]
    Cancelled,

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using DeliveryError.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

impl DeliveryError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    pub fn encoder_open(
        codec: impl Into<String>,
        step: EncoderSetupStep,
        msg: impl Into<String>,
    ) -> Self {
        Self::EncoderOpen {
            codec: codec.into(),
            step,
            message: msg.into(),
        }
    }

    pub fn encoder_stream(msg: impl Into<String>) -> Self {
        Self::EncoderStream {
            message: msg.into(),
        }
    }

    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source {
            message: msg.into(),
        }
    }

    pub fn image(msg: impl Into<String>) -> Self {
        Self::Image {
            message: msg.into(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported {
            message: msg.into(),
        }
    }

    pub fn other(msg: impl std::fmt::Display) -> Self {
        Self::Other(anyhow::anyhow!("{msg}"))
    }

    /// Whether this error is a deliberate cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error lets a job fall back to the next ranked encoder setting.
    pub fn is_encoder_open_failure(&self) -> bool {
        matches!(self, Self::EncoderOpen { .. })
    }
}
