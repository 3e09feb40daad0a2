//! Wire messages and frame codecs
//!
//! Channels exchange [`Message`] values. Setup-handshake messages (login,
//! directory and schema dictionaries) are consumed by the reactor; everything
//! else is delivered to the application's message callback.

use serde::{Deserialize, Serialize};

use crate::errors::CodecError;

/// Largest frame the bincode codec will produce or accept (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// Which half of the field schema a dictionary message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaPart {
    /// Field definitions
    Fields,
    /// Enumerated value tables
    Enums,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub user_name: String,
    pub application_name: String,
    /// Bearer token for session-managed channels
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub accepted: bool,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_id: u16,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub part: SchemaPart,
    pub name: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    pub stream_id: i32,
    pub payload: Vec<u8>,
}

/// Messages carried over a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    LoginRequest(LoginRequest),
    LoginResponse(LoginResponse),
    DirectoryRequest,
    DirectoryResponse(Vec<ServiceInfo>),
    SchemaRequest(SchemaPart),
    SchemaResponse(Schema),
    Data(DataMessage),
}

impl Message {
    /// Short name for logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Message::LoginRequest(_) => "login request",
            Message::LoginResponse(_) => "login response",
            Message::DirectoryRequest => "directory request",
            Message::DirectoryResponse(_) => "directory response",
            Message::SchemaRequest(_) => "schema request",
            Message::SchemaResponse(_) => "schema response",
            Message::Data(_) => "data message",
        }
    }

    pub fn data(stream_id: i32, payload: impl Into<Vec<u8>>) -> Self {
        Message::Data(DataMessage {
            stream_id,
            payload: payload.into(),
        })
    }
}

// ----------------------------------------------------------------------------
// Codecs
// ----------------------------------------------------------------------------

/// Converts messages to and from link frames
pub trait MessageCodec: Send + Sync {
    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, frame: &[u8]) -> Result<Message, CodecError>;
}

/// Bincode framing used by default
#[derive(Debug, Clone, Copy)]
pub struct BincodeCodec {
    max_frame_size: usize,
}

impl BincodeCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for BincodeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec for BincodeCodec {
    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let frame = bincode::serialize(message).map_err(CodecError::Encode)?;
        if frame.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }
        Ok(frame)
    }

    fn decode(&self, frame: &[u8]) -> Result<Message, CodecError> {
        if frame.is_empty() {
            return Err(CodecError::EmptyFrame);
        }
        if frame.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }
        bincode::deserialize(frame).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_response_survives_codec() {
        let codec = BincodeCodec::new();
        let message = Message::SchemaResponse(Schema {
            part: SchemaPart::Enums,
            name: "RWFEnum".into(),
            body: vec![1, 2, 3],
        });

        let frame = codec.encode(&message).unwrap();
        assert_eq!(codec.decode(&frame).unwrap(), message);
    }

    #[test]
    fn test_empty_frame_rejected() {
        let codec = BincodeCodec::new();
        assert!(matches!(codec.decode(&[]), Err(CodecError::EmptyFrame)));
    }

    #[test]
    fn test_garbage_frame_rejected() {
        let codec = BincodeCodec::new();
        assert!(matches!(
            codec.decode(&[0xff, 0xff, 0xff, 0xff]),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_frame_limit_enforced() {
        let codec = BincodeCodec::with_max_frame_size(16);
        let message = Message::data(1, vec![0u8; 64]);
        assert!(matches!(
            codec.encode(&message),
            Err(CodecError::FrameTooLarge { max: 16, .. })
        ));
    }

    #[test]
    fn test_message_kind_names() {
        assert_eq!(Message::DirectoryRequest.kind(), "directory request");
        assert_eq!(Message::data(1, b"x".to_vec()).kind(), "data message");
    }
}
