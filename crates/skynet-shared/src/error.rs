use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Encoded datagram too large: {size} bytes (max {max})")]
    Encoding { size: usize, max: usize },

    #[error("Malformed datagram: {0}")]
    Malformed(String),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}
