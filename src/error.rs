use thiserror::Error;

/// Errors raised by the engine itself. Handler code returns `anyhow::Result`
/// and may carry these inside.
#[derive(Error, Debug)]
pub enum DnsError {
    /// A response was finalized twice; a DNS transaction answers exactly once.
    #[error("Cannot send more than one answer for an already-resolved query")]
    DuplicateAnswer,

    #[error("Cannot modify response after it has been sent")]
    ModifiedAfterSent,

    #[error("Malformed DNS message: {0}")]
    Malformed(String),

    #[error("Message does not fit the wire format: {0}")]
    Encode(String),

    #[error("Invalid route pattern '{0}'")]
    InvalidPattern(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// The transaction was dropped before any handler answered it.
    #[error("Transaction abandoned before an answer was produced")]
    Abandoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DnsError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}
