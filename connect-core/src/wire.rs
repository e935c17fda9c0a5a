//! Encoding: envelopes are UTF-8 JSON, binary fields are standard base64.
//! Stream transports add framing: length-prefix (4 bytes LE) + JSON envelope.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;

use crate::protocol::{ConnectMessage, RawMessage, SCHEME_VERSION};

const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode an envelope as JSON bytes.
pub fn encode_message<P: Serialize>(msg: &ConnectMessage<P>) -> Result<Vec<u8>, MessageError> {
    serde_json::to_vec(msg).map_err(MessageError::Encode)
}

/// Decode an inbound envelope. Unknown actions and newer schemes are errors.
pub fn decode_message(bytes: &[u8]) -> Result<RawMessage, MessageError> {
    let msg: RawMessage = serde_json::from_slice(bytes).map_err(MessageError::Decode)?;
    if msg.scheme_version > SCHEME_VERSION {
        return Err(MessageError::UnsupportedScheme(msg.scheme_version));
    }
    Ok(msg)
}

/// Error encoding or decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("unsupported scheme version {0}")]
    UnsupportedScheme(u32),
    #[error("invalid base64 field")]
    Base64(#[from] base64::DecodeError),
}

pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn from_base64(s: &str) -> Result<Vec<u8>, MessageError> {
    Ok(STANDARD.decode(s)?)
}

/// Wrap an encoded envelope into a single frame: 4 bytes LE length + payload.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Error wrapping a payload into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the payload and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes or too large).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ActionTag, Empty};
    use crate::requests::CloseWithError;

    fn sample_close() -> Vec<u8> {
        let msg = ConnectMessage::new(
            ActionTag::CloseWithError,
            CloseWithError {
                error_code: 1020,
                error_message: Some("salt mismatch".into()),
            },
        );
        encode_message(&msg).unwrap()
    }

    #[test]
    fn decode_keeps_action_and_payload() {
        let raw = decode_message(&sample_close()).unwrap();
        assert_eq!(raw.action, ActionTag::CloseWithError);
        assert_eq!(raw.payload["errorCode"], 1020);
    }

    #[test]
    fn newer_scheme_rejected() {
        let mut msg = ConnectMessage::new(ActionTag::CloseWithSuccess, Empty);
        msg.scheme_version = SCHEME_VERSION + 1;
        let bytes = encode_message(&msg).unwrap();
        assert!(matches!(
            decode_message(&bytes),
            Err(MessageError::UnsupportedScheme(v)) if v == SCHEME_VERSION + 1
        ));
    }

    #[test]
    fn older_scheme_accepted() {
        let mut msg = ConnectMessage::new(ActionTag::CloseWithSuccess, Empty);
        msg.scheme_version = 1;
        let bytes = encode_message(&msg).unwrap();
        assert!(decode_message(&bytes).is_ok());
    }

    #[test]
    fn garbage_is_decode_error() {
        assert!(matches!(
            decode_message(b"not json"),
            Err(MessageError::Decode(_))
        ));
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_close()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let mut bytes = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn multiple_frames() {
        let a = sample_close();
        let b = encode_message(&ConnectMessage::new(ActionTag::CloseWithSuccess, Empty)).unwrap();
        let mut buf = encode_frame(&a).unwrap();
        buf.extend_from_slice(&encode_frame(&b).unwrap());
        let (p1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(p1, a.as_slice());
        let (p2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(p2, b.as_slice());
        assert_eq!(n1 + n2, buf.len());
    }

    #[test]
    fn base64_fields() {
        let s = to_base64(b"\x00\x01salt");
        assert_eq!(from_base64(&s).unwrap(), b"\x00\x01salt");
        assert!(from_base64("***").is_err());
    }
}
