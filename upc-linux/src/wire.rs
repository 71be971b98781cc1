//! Distributor socket framing: length-prefix (4 bytes LE) + bincode payload.
//! Connector writes `OutboundMessage` frames and reads `InboundMessage` frames.

use serde::de::DeserializeOwned;
use serde::Serialize;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Payload length announced by a frame header; errors past the size cap.
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode one frame from the front of `bytes`. Returns the message and the bytes consumed.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use upc_core::{InboundMessage, OutboundMessage};

    fn sample_register() -> OutboundMessage {
        OutboundMessage::Register {
            token: "3f1c0d9e-6a57-4a58-9a57-1b2c3d4e5f60".into(),
            auth_token: Some("auth".into()),
            message_for_peer: None,
            vapid: None,
            application: "org.example.chat".into(),
            features: vec!["org.unifiedpush.android.distributor.feature.BYTES_MESSAGE".into()],
        }
    }

    #[test]
    fn roundtrip_register() {
        let msg = sample_register();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n): (OutboundMessage, usize) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_register()).unwrap();
        assert!(matches!(
            decode_frame::<OutboundMessage>(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame::<OutboundMessage>(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_header_rejected() {
        let header = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(frame_len(header), Err(FrameDecodeError::TooLarge)));
        assert!(matches!(
            decode_frame::<InboundMessage>(&header),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn multiple_messages() {
        let a = InboundMessage::Linked {
            link_token: "lt".into(),
            auth_token: "at".into(),
        };
        let b = InboundMessage::Message {
            token: "t".into(),
            content: vec![1, 2, 3],
            message_id: Some("m".into()),
        };
        let mut buf = encode_frame(&a).unwrap();
        let first = buf.len();
        buf.extend_from_slice(&encode_frame(&b).unwrap());
        let (m1, n1): (InboundMessage, usize) = decode_frame(&buf).unwrap();
        assert_eq!(n1, first);
        let (m2, _): (InboundMessage, usize) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(m1, a);
        assert_eq!(m2, b);
    }
}
