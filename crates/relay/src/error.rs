use courier_common::FromMessage;

/// Crate-wide result type for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed dispatch errors. The pipeline branches on the class: stale
/// references get one retry, oversized/slow attachments drop only the
/// attachment, everything else drops the message.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The destination rejected the request.
    #[error("endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },

    /// A 4xx that points at a reply reference the destination no longer
    /// knows about.
    #[error("stale reply reference")]
    StaleReference,

    /// Attachment exceeds the download size cap.
    #[error("attachment too large: {size} bytes (cap {cap})")]
    AttachmentTooLarge { size: u64, cap: u64 },

    /// Attachment download exceeded the time cap.
    #[error("attachment download timed out")]
    DownloadTimeout,

    /// Transport-level HTTP failure.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization failed.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Message(String),
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

courier_common::impl_context!();
