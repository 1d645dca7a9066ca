//! Tunnel frame format.
//!
//! Defines the plaintext layout carried inside each sealed packet. The first
//! plaintext byte is the frame kind; DATA frames carry one FEC shard with
//! its block coordinates.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Frame kinds in the tunnel protocol.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// FEC shard of a data block
    Data = 0x01,
    /// Liveness probe, empty body
    Keepalive = 0x02,
    /// Control message (subtype in first body byte)
    Control = 0x03,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameKind::Data),
            0x02 => Ok(FrameKind::Keepalive),
            0x03 => Ok(FrameKind::Control),
            _ => Err(Error::parse(format!("unknown frame kind: {}", value))),
        }
    }
}

/// Control message subtypes.
pub mod control {
    /// Path MTU probe: body is padding of the probed size
    pub const MTU_ECHO_REQUEST: u8 = 0x00;
    /// Reply to an MTU probe: body echoes the probed size as u16
    pub const MTU_ECHO_REPLY: u8 = 0x01;
    /// Peer is closing the connection
    pub const FIN_NOTICE: u8 = 0x02;
}

/// Size of the frame kind byte.
pub const KIND_SIZE: usize = 1;

/// Size of the DATA shard header after the kind byte.
///
/// `[block-id:4][shard-index:1][total-data:1][total-parity:1][shard-size:2]`
pub const SHARD_HEADER_SIZE: usize = 9;

/// A tunnel frame.
///
/// Wire layout (plaintext, before sealing):
/// ```text
/// DATA:      [kind=1][block-id:4][shard-index:1][total-data:1]
///            [total-parity:1][shard-size:2][payload:shard-size]
/// KEEPALIVE: [kind=2]
/// CONTROL:   [kind=3][subtype:1][body...]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One FEC shard tagged with its block coordinates.
    Data {
        /// Monotonic per-sender block counter
        block_id: u32,
        /// Position within the block, data shards first
        shard_index: u8,
        /// Number of data shards in the block
        total_data: u8,
        /// Number of parity shards in the block
        total_parity: u8,
        /// Shard bytes, uniform size within one block
        payload: Bytes,
    },
    /// Liveness probe.
    Keepalive,
    /// Control message.
    Control {
        /// One of the [`control`] subtypes
        subtype: u8,
        /// Subtype-specific body
        body: Bytes,
    },
}

impl Frame {
    /// Serialize the frame to bytes.
    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Data {
                block_id,
                shard_index,
                total_data,
                total_parity,
                payload,
            } => {
                let mut buf =
                    BytesMut::with_capacity(KIND_SIZE + SHARD_HEADER_SIZE + payload.len());
                buf.put_u8(FrameKind::Data as u8);
                buf.put_u32(*block_id);
                buf.put_u8(*shard_index);
                buf.put_u8(*total_data);
                buf.put_u8(*total_parity);
                buf.put_u16(payload.len() as u16);
                buf.put_slice(payload);
                buf.freeze()
            }
            Frame::Keepalive => Bytes::from_static(&[FrameKind::Keepalive as u8]),
            Frame::Control { subtype, body } => {
                let mut buf = BytesMut::with_capacity(KIND_SIZE + 1 + body.len());
                buf.put_u8(FrameKind::Control as u8);
                buf.put_u8(*subtype);
                buf.put_slice(body);
                buf.freeze()
            }
        }
    }

    /// Deserialize a frame from bytes.
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::parse("empty frame"));
        }

        let kind = FrameKind::try_from(data.get_u8())?;
        match kind {
            FrameKind::Data => {
                if data.len() < SHARD_HEADER_SIZE {
                    return Err(Error::parse(format!(
                        "shard header truncated: {} bytes",
                        data.len()
                    )));
                }
                let block_id = data.get_u32();
                let shard_index = data.get_u8();
                let total_data = data.get_u8();
                let total_parity = data.get_u8();
                let shard_size = data.get_u16() as usize;

                if data.len() < shard_size {
                    return Err(Error::parse(format!(
                        "shard payload truncated: expected {}, got {}",
                        shard_size,
                        data.len()
                    )));
                }
                if total_data == 0 || total_parity == 0 {
                    return Err(Error::parse("shard declares zero data or parity count"));
                }
                if shard_index as usize >= total_data as usize + total_parity as usize {
                    return Err(Error::parse(format!(
                        "shard index {} out of range for {}+{} block",
                        shard_index, total_data, total_parity
                    )));
                }

                let payload = data.split_to(shard_size);
                Ok(Frame::Data {
                    block_id,
                    shard_index,
                    total_data,
                    total_parity,
                    payload,
                })
            }
            FrameKind::Keepalive => Ok(Frame::Keepalive),
            FrameKind::Control => {
                if data.is_empty() {
                    return Err(Error::parse("control frame without subtype"));
                }
                let subtype = data.get_u8();
                Ok(Frame::Control {
                    subtype,
                    body: data,
                })
            }
        }
    }

    /// Frame kind discriminant.
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Data { .. } => FrameKind::Data,
            Frame::Keepalive => FrameKind::Keepalive,
            Frame::Control { .. } => FrameKind::Control,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_roundtrip() {
        let original = Frame::Data {
            block_id: 7,
            shard_index: 3,
            total_data: 8,
            total_parity: 2,
            payload: Bytes::from_static(b"shard bytes"),
        };

        let decoded = Frame::decode(original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_keepalive_is_one_byte() {
        let encoded = Frame::Keepalive.encode();
        assert_eq!(encoded.as_ref(), &[0x02]);
        assert_eq!(Frame::decode(encoded).unwrap(), Frame::Keepalive);
    }

    #[test]
    fn test_control_frame() {
        let frame = Frame::Control {
            subtype: control::MTU_ECHO_REPLY,
            body: Bytes::from_static(&[0x05, 0x14]),
        };
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_rejects_bad_kind() {
        assert!(Frame::decode(Bytes::from_static(&[0xFF])).is_err());
        assert!(Frame::decode(Bytes::new()).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_shard() {
        let frame = Frame::Data {
            block_id: 1,
            shard_index: 0,
            total_data: 4,
            total_parity: 2,
            payload: Bytes::from_static(b"0123456789"),
        };
        let mut encoded = frame.encode().to_vec();
        encoded.truncate(encoded.len() - 3);
        assert!(Frame::decode(Bytes::from(encoded)).is_err());
    }

    #[test]
    fn test_decode_rejects_out_of_range_index() {
        let frame = Frame::Data {
            block_id: 1,
            shard_index: 10,
            total_data: 8,
            total_parity: 2,
            payload: Bytes::from_static(b"x"),
        };
        assert!(Frame::decode(frame.encode()).is_err());
    }
}
