use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EcError {
    #[error("Invalid compressed point")]
    InvalidPoint,

    #[error("Invalid scalar value")]
    InvalidScalar,

    #[error("Invalid hex encoding")]
    InvalidHex,
}

pub type Result<T> = std::result::Result<T, EcError>;
