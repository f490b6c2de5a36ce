// ABOUTME: Wire types for the buildwire build-orchestration protocol.
// ABOUTME: Envelope, origin, body variants, closed actor/type/status enums and the JSON codec.

pub mod body;
pub mod codec;
pub mod envelope;
pub mod error;

pub use body::{Body, Contract, Messages, StatusDetails};
pub use codec::{decode, encode, is_supported_version, PROTOCOL_VERSION, SUPPORTED_VERSIONS};
pub use envelope::{Actor, Envelope, MessageType, Origin, Status};
pub use error::{DecodeError, EncodeError};
