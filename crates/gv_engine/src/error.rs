use gv_wire::{Token, WireError};
use thiserror::Error;

/// Result alias for engine operations.
pub type SerialResult<T> = Result<T, SerialError>;

/// Everything that can go wrong while registering codecs, resolving type
/// names, or running a serialize / deserialize / deep-copy operation.
///
/// No error is swallowed: registration errors abort engine construction,
/// operation errors abort the current operation and surface to the
/// caller. Errors raised by user codecs propagate unchanged through
/// [`SerialError::Codec`].
#[derive(Debug, Error)]
pub enum SerialError {
    // -------------------------------------------------------------------------
    // Registration

    #[error("serializer and deserializer for `{type_key}` must be registered together")]
    RegistrationInconsistency { type_key: String },

    #[error("registration for `{type_key}` declares no codecs and no marker keys")]
    EmptyRegistration { type_key: String },

    #[error("keyed serializer id {0} is registered twice")]
    DuplicateKeyedSerializer(u8),

    #[error("known-type manifest is malformed: {0}")]
    Manifest(#[from] serde_json::Error),

    // -------------------------------------------------------------------------
    // Lookup

    #[error("no codec found for type `{type_key}` (runtime type `{type_name}`)")]
    NoCodecFound {
        type_key: String,
        type_name: String,
    },

    #[error("cannot resolve type name `{key}`")]
    UnresolvableTypeName { key: String },

    // -------------------------------------------------------------------------
    // Stream format

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("unexpected token {token:?} at offset {position}")]
    UnexpectedToken { token: Token, position: u32 },

    #[error("stream collapsed the type header, but no expected type was supplied")]
    ExpectedTypeMissing,

    #[error("unknown keyed serializer id {0} on the stream")]
    UnknownKeyedSerializer(u8),

    #[error("back-reference to offset {0}, which holds no object")]
    UnknownReference(u32),

    #[error("decoded a `{actual}` where `{expected}` was requested")]
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },

    #[error("array of rank {actual} where rank {expected} was specified")]
    ArrayRankMismatch { expected: usize, actual: usize },

    #[error("value {value} does not fit the declared underlying width of enum `{type_key}`")]
    EnumValueOutOfRange { type_key: String, value: i64 },

    #[error("{value} is not a known discriminant of enum `{type_key}`")]
    UnknownEnumValue { type_key: String, value: i64 },

    // -------------------------------------------------------------------------
    // User codecs

    /// An error raised inside a user-supplied codec, propagated unchanged.
    #[error("{0}")]
    Codec(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl SerialError {
    /// Wraps an error raised by a user codec.
    pub fn codec(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        SerialError::Codec(Box::new(err))
    }
}
