use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Canonicalization failed: {0}")]
    Canonicalization(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("Invalid agent identifier: {0}")]
    InvalidAid(String),

    #[error("Passport validation failed: {0}")]
    PassportValidation(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}
