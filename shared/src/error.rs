/*!
Common error types for the DPU control Rust components.
*/

use thiserror::Error;

/// Common result type used throughout the shared library
pub type Result<T> = std::result::Result<T, SharedError>;

/// Comprehensive error type for all shared operations
#[derive(Error, Debug)]
pub enum SharedError {
    /// I/O errors (file operations, link reads, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Packet classification and decoding errors
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// A register name that does not exist in the register map
    #[error("Unknown register: {0}")]
    UnknownRegister(String),

    /// A (register, field) pair that does not exist in the register map
    #[error("Unknown field {field} in register {register}")]
    FieldNotFound { register: String, field: String },

    /// Memory map accesses outside the mirrored register space
    #[error("Address range out of bounds: {0}")]
    AddressOutOfRange(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic errors with context
    #[error("Error: {0}")]
    Generic(String),
}

impl SharedError {
    /// Create a new generic error with a message
    pub fn new(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a new invalid packet error
    pub fn invalid_packet(msg: impl Into<String>) -> Self {
        Self::InvalidPacket(msg.into())
    }

    /// Create a new field-not-found error
    pub fn field_not_found(register: impl Into<String>, field: impl Into<String>) -> Self {
        Self::FieldNotFound {
            register: register.into(),
            field: field.into(),
        }
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
