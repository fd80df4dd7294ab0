//! Frame wire format: bit-exact marshalling of overlay frames.
//!
//! Every frame starts with a fixed 10-byte header:
//!
//! ```text
//!   [4 bytes: magic "pine"]
//!   [u8: version, currently 0]
//!   [u8: frame type]
//!   [2 bytes: extra, reserved, zero]
//!   [u16 BE: frame_len — total frame size including this header]
//! ```
//!
//! A reader can size any frame after peeking the header. Multi-byte
//! integers are big-endian; ports and sequences are varints (see
//! [`crate::types`]); coordinates carry a 2-byte byte-count prefix.

use crate::error::WireError;
use crate::types::{Coordinates, PublicKey, RootAnnouncement, Watermark, PUBLIC_KEY_SIZE};

/// Magic bytes at the start of every frame: "pine".
pub const MAGIC: [u8; 4] = [0x70, 0x69, 0x6e, 0x65];

/// The only wire version this implementation speaks.
pub const VERSION: u8 = 0;

/// Fixed header size.
pub const HEADER_SIZE: usize = 10;

/// Upper bound on a whole frame; `frame_len` is a u16.
pub const MAX_FRAME_SIZE: usize = 65535;

/// Frame type codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Keepalive = 0,
    TreeAnnouncement = 1,
    TreeRouted = 2,
    Bootstrap = 3,
    SnekRouted = 4,
    SnekPing = 5,
    SnekPong = 6,
    TreePing = 7,
    TreePong = 8,
    BootstrapAck = 9,
    Teardown = 10,
}

impl TryFrom<u8> for FrameType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Keepalive),
            1 => Ok(Self::TreeAnnouncement),
            2 => Ok(Self::TreeRouted),
            3 => Ok(Self::Bootstrap),
            4 => Ok(Self::SnekRouted),
            5 => Ok(Self::SnekPing),
            6 => Ok(Self::SnekPong),
            7 => Ok(Self::TreePing),
            8 => Ok(Self::TreePong),
            9 => Ok(Self::BootstrapAck),
            10 => Ok(Self::Teardown),
            other => Err(WireError::UnknownFrameType(other)),
        }
    }
}

/// One overlay frame.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Frame {
    Keepalive,
    TreeAnnouncement(RootAnnouncement),
    /// Application traffic routed greedily by tree coordinates.
    TreeRouted {
        destination: Coordinates,
        source: Coordinates,
        payload: Vec<u8>,
    },
    TreePing {
        destination: Coordinates,
        source: Coordinates,
        payload: Vec<u8>,
    },
    TreePong {
        destination: Coordinates,
        source: Coordinates,
        payload: Vec<u8>,
    },
    /// SNEK path discovery, routed towards the sender's own key.
    Bootstrap {
        destination_key: PublicKey,
        watermark: Watermark,
        payload: Vec<u8>,
    },
    /// Reply to a bootstrap, greedy-routed back along tree coordinates;
    /// installs path state at every hop it traverses.
    BootstrapAck {
        destination: Coordinates,
        source: Coordinates,
        payload: Vec<u8>,
    },
    /// Application traffic routed by keyspace.
    SnekRouted {
        destination_key: PublicKey,
        source_key: PublicKey,
        watermark: Watermark,
        payload: Vec<u8>,
    },
    SnekPing {
        destination_key: PublicKey,
        source_key: PublicKey,
        watermark: Watermark,
        payload: Vec<u8>,
    },
    SnekPong {
        destination_key: PublicKey,
        source_key: PublicKey,
        watermark: Watermark,
        payload: Vec<u8>,
    },
    /// Removes an installed snake path hop-by-hop.
    Teardown {
        destination_key: PublicKey,
        payload: Vec<u8>,
    },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Keepalive => FrameType::Keepalive,
            Frame::TreeAnnouncement(_) => FrameType::TreeAnnouncement,
            Frame::TreeRouted { .. } => FrameType::TreeRouted,
            Frame::TreePing { .. } => FrameType::TreePing,
            Frame::TreePong { .. } => FrameType::TreePong,
            Frame::Bootstrap { .. } => FrameType::Bootstrap,
            Frame::BootstrapAck { .. } => FrameType::BootstrapAck,
            Frame::SnekRouted { .. } => FrameType::SnekRouted,
            Frame::SnekPing { .. } => FrameType::SnekPing,
            Frame::SnekPong { .. } => FrameType::SnekPong,
            Frame::Teardown { .. } => FrameType::Teardown,
        }
    }

    /// Protocol frames ride the lossless FIFO; everything else is traffic.
    pub fn is_proto(&self) -> bool {
        matches!(
            self.frame_type(),
            FrameType::TreeAnnouncement
                | FrameType::Bootstrap
                | FrameType::BootstrapAck
                | FrameType::Teardown
        )
    }

    /// The loop-avoidance watermark, for SNEK-routed frame types.
    pub fn watermark(&self) -> Option<Watermark> {
        match self {
            Frame::Bootstrap { watermark, .. }
            | Frame::SnekRouted { watermark, .. }
            | Frame::SnekPing { watermark, .. }
            | Frame::SnekPong { watermark, .. } => Some(*watermark),
            _ => None,
        }
    }

    /// Marshal into `buf`, returning the number of bytes written.
    pub fn marshal(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        let mut body = Vec::with_capacity(64);
        match self {
            Frame::Keepalive => {}
            Frame::TreeAnnouncement(ann) => {
                ann.marshal_to(&mut body);
            }
            Frame::TreeRouted {
                destination,
                source,
                payload,
            }
            | Frame::TreePing {
                destination,
                source,
                payload,
            }
            | Frame::TreePong {
                destination,
                source,
                payload,
            }
            | Frame::BootstrapAck {
                destination,
                source,
                payload,
            } => {
                push_payload_len(&mut body, payload)?;
                destination.marshal_to(&mut body);
                source.marshal_to(&mut body);
                body.extend_from_slice(payload);
            }
            Frame::Bootstrap {
                destination_key,
                watermark,
                payload,
            } => {
                push_payload_len(&mut body, payload)?;
                body.extend_from_slice(&destination_key.0);
                watermark.marshal_to(&mut body);
                body.extend_from_slice(payload);
            }
            Frame::SnekRouted {
                destination_key,
                source_key,
                watermark,
                payload,
            }
            | Frame::SnekPing {
                destination_key,
                source_key,
                watermark,
                payload,
            }
            | Frame::SnekPong {
                destination_key,
                source_key,
                watermark,
                payload,
            } => {
                push_payload_len(&mut body, payload)?;
                body.extend_from_slice(&destination_key.0);
                body.extend_from_slice(&source_key.0);
                watermark.marshal_to(&mut body);
                body.extend_from_slice(payload);
            }
            Frame::Teardown {
                destination_key,
                payload,
            } => {
                push_payload_len(&mut body, payload)?;
                body.extend_from_slice(&destination_key.0);
                body.extend_from_slice(payload);
            }
        }

        let total = HEADER_SIZE + body.len();
        if total > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(total));
        }
        if buf.len() < total {
            return Err(WireError::BufferTooSmall);
        }
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = VERSION;
        buf[5] = self.frame_type() as u8;
        buf[6] = 0;
        buf[7] = 0;
        buf[8..10].copy_from_slice(&(total as u16).to_be_bytes());
        buf[10..total].copy_from_slice(&body);
        Ok(total)
    }

    /// Parse one frame from the start of `data`, returning the frame and
    /// the number of bytes consumed.
    pub fn unmarshal(data: &[u8]) -> Result<(Frame, usize), WireError> {
        if data.len() < HEADER_SIZE {
            return Err(WireError::Truncated);
        }
        if data[0..4] != MAGIC {
            return Err(WireError::BadMagic);
        }
        if data[4] != VERSION {
            return Err(WireError::UnsupportedVersion(data[4]));
        }
        let frame_type = FrameType::try_from(data[5])?;
        let frame_len = u16::from_be_bytes([data[8], data[9]]) as usize;
        if frame_len < HEADER_SIZE {
            return Err(WireError::InconsistentLength);
        }
        if data.len() < frame_len {
            return Err(WireError::Truncated);
        }
        let body = &data[HEADER_SIZE..frame_len];

        let frame = match frame_type {
            FrameType::Keepalive => {
                if !body.is_empty() {
                    return Err(WireError::InconsistentLength);
                }
                Frame::Keepalive
            }
            FrameType::TreeAnnouncement => {
                Frame::TreeAnnouncement(RootAnnouncement::unmarshal(body)?)
            }
            FrameType::TreeRouted
            | FrameType::TreePing
            | FrameType::TreePong
            | FrameType::BootstrapAck => {
                let (payload_len, mut offset) = read_payload_len(body)?;
                let (destination, n) = Coordinates::unmarshal(&body[offset..])?;
                offset += n;
                let (source, n) = Coordinates::unmarshal(&body[offset..])?;
                offset += n;
                let payload = read_payload(body, offset, payload_len)?;
                match frame_type {
                    FrameType::TreeRouted => Frame::TreeRouted {
                        destination,
                        source,
                        payload,
                    },
                    FrameType::TreePing => Frame::TreePing {
                        destination,
                        source,
                        payload,
                    },
                    FrameType::TreePong => Frame::TreePong {
                        destination,
                        source,
                        payload,
                    },
                    _ => Frame::BootstrapAck {
                        destination,
                        source,
                        payload,
                    },
                }
            }
            FrameType::Bootstrap => {
                let (payload_len, mut offset) = read_payload_len(body)?;
                let destination_key = read_key(body, &mut offset)?;
                let (watermark, n) = Watermark::unmarshal(&body[offset..])?;
                offset += n;
                let payload = read_payload(body, offset, payload_len)?;
                Frame::Bootstrap {
                    destination_key,
                    watermark,
                    payload,
                }
            }
            FrameType::SnekRouted | FrameType::SnekPing | FrameType::SnekPong => {
                let (payload_len, mut offset) = read_payload_len(body)?;
                let destination_key = read_key(body, &mut offset)?;
                let source_key = read_key(body, &mut offset)?;
                let (watermark, n) = Watermark::unmarshal(&body[offset..])?;
                offset += n;
                let payload = read_payload(body, offset, payload_len)?;
                match frame_type {
                    FrameType::SnekRouted => Frame::SnekRouted {
                        destination_key,
                        source_key,
                        watermark,
                        payload,
                    },
                    FrameType::SnekPing => Frame::SnekPing {
                        destination_key,
                        source_key,
                        watermark,
                        payload,
                    },
                    _ => Frame::SnekPong {
                        destination_key,
                        source_key,
                        watermark,
                        payload,
                    },
                }
            }
            FrameType::Teardown => {
                let (payload_len, mut offset) = read_payload_len(body)?;
                let destination_key = read_key(body, &mut offset)?;
                let payload = read_payload(body, offset, payload_len)?;
                Frame::Teardown {
                    destination_key,
                    payload,
                }
            }
        };
        Ok((frame, frame_len))
    }
}

/// Total length of the frame whose header starts at `header`, if the
/// header is well-formed. Used by the reader to size the rest of a frame.
pub fn peek_frame_len(header: &[u8; HEADER_SIZE]) -> Result<usize, WireError> {
    if header[0..4] != MAGIC {
        return Err(WireError::BadMagic);
    }
    if header[4] != VERSION {
        return Err(WireError::UnsupportedVersion(header[4]));
    }
    FrameType::try_from(header[5])?;
    let frame_len = u16::from_be_bytes([header[8], header[9]]) as usize;
    if frame_len < HEADER_SIZE {
        return Err(WireError::InconsistentLength);
    }
    Ok(frame_len)
}

fn push_payload_len(body: &mut Vec<u8>, payload: &[u8]) -> Result<(), WireError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(payload.len()));
    }
    body.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    Ok(())
}

fn read_payload_len(body: &[u8]) -> Result<(usize, usize), WireError> {
    if body.len() < 2 {
        return Err(WireError::Truncated);
    }
    Ok((u16::from_be_bytes([body[0], body[1]]) as usize, 2))
}

fn read_key(body: &[u8], offset: &mut usize) -> Result<PublicKey, WireError> {
    if body.len() < *offset + PUBLIC_KEY_SIZE {
        return Err(WireError::Truncated);
    }
    let mut key = [0u8; PUBLIC_KEY_SIZE];
    key.copy_from_slice(&body[*offset..*offset + PUBLIC_KEY_SIZE]);
    *offset += PUBLIC_KEY_SIZE;
    Ok(PublicKey(key))
}

/// The payload must occupy exactly the remainder of the frame body.
fn read_payload(body: &[u8], offset: usize, payload_len: usize) -> Result<Vec<u8>, WireError> {
    if body.len() != offset + payload_len {
        return Err(WireError::InconsistentLength);
    }
    Ok(body[offset..].to_vec())
}
