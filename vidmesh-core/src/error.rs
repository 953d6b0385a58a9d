use thiserror::Error;

/// Node-level error type. Everything user- or session-visible funnels into
/// one of these kinds; HTTP and ingest edges map them onto status codes.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("stream already exists")]
    AlreadyExists,

    #[error("rtmp publish failed")]
    RtmpPublish,

    #[error("broadcast failed")]
    Broadcast,

    #[error("insufficient token balance")]
    InsufficientBalance,

    #[error("session ended")]
    SessionEnded,

    #[error("deadline exceeded")]
    Timeout,

    #[error("discovery error: {code}")]
    Discovery { code: String },

    #[error("canceled")]
    Canceled,

    #[error("end of stream")]
    Eof,

    #[error("invalid price")]
    InvalidPrice,

    #[error("invalid recipient rand")]
    InvalidRecipientRand,

    #[error("invalid ticket face value")]
    InvalidTicketFaceValue,

    #[error("invalid ticket win probability")]
    InvalidTicketWinProb,

    #[error("payment error: {0}")]
    Payment(String),

    #[error("chain error: {0}")]
    Chain(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("media error: {0}")]
    Media(vidmesh_media::MediaError),
}

impl From<vidmesh_media::MediaError> for Error {
    fn from(err: vidmesh_media::MediaError) -> Self {
        use vidmesh_media::MediaError as M;
        match err {
            M::NotFound => Self::NotFound,
            M::AlreadyExists => Self::AlreadyExists,
            M::SessionEnded => Self::SessionEnded,
            M::Eof => Self::Eof,
            M::Canceled => Self::Canceled,
            M::Timeout => Self::Timeout,
            other => Self::Media(other),
        }
    }
}

impl Error {
    /// Classify a payment failure message into the ticket/payment family.
    pub fn from_payment_message(msg: &str) -> Self {
        if msg.contains("Expected price") {
            Self::InvalidPrice
        } else if msg.contains("invalid already revealed recipientRand") {
            Self::InvalidRecipientRand
        } else if msg.contains("invalid ticket faceValue") {
            Self::InvalidTicketFaceValue
        } else if msg.contains("invalid ticket winProb") {
            Self::InvalidTicketWinProb
        } else {
            Self::Payment(msg.to_string())
        }
    }
}

/// Normalize a discovery failure into a stable error code. Known failure
/// classes collapse to a fixed label; anything else passes through raw.
pub fn normalize_discovery_code(raw: &str) -> String {
    if raw.contains("OrchestratorCapped") {
        "OrchestratorCapped".to_string()
    } else if raw.contains("Canceled") || raw.contains("canceled") {
        "Canceled".to_string()
    } else {
        raw.to_string()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_error_mapping() {
        use vidmesh_media::MediaError as M;
        assert!(matches!(Error::from(M::NotFound), Error::NotFound));
        assert!(matches!(Error::from(M::Eof), Error::Eof));
        assert!(matches!(Error::from(M::Canceled), Error::Canceled));
        assert!(matches!(
            Error::from(M::EnvelopeDecode("bad".into())),
            Error::Media(_)
        ));
    }

    #[test]
    fn test_discovery_code_normalization() {
        assert_eq!(
            normalize_discovery_code("rpc error: OrchestratorCapped at 10"),
            "OrchestratorCapped"
        );
        assert_eq!(
            normalize_discovery_code("context Canceled by caller"),
            "Canceled"
        );
        assert_eq!(normalize_discovery_code("dial tcp refused"), "dial tcp refused");
    }

    #[test]
    fn test_payment_message_classification() {
        assert!(matches!(
            Error::from_payment_message("Expected price of 5 wei"),
            Error::InvalidPrice
        ));
        assert!(matches!(
            Error::from_payment_message("invalid ticket faceValue"),
            Error::InvalidTicketFaceValue
        ));
        assert!(matches!(
            Error::from_payment_message("invalid ticket winProb"),
            Error::InvalidTicketWinProb
        ));
        assert!(matches!(
            Error::from_payment_message("invalid already revealed recipientRand"),
            Error::InvalidRecipientRand
        ));
        assert!(matches!(
            Error::from_payment_message("something else"),
            Error::Payment(_)
        ));
    }
}
