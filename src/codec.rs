//! Wire framing: the base header plus the five frame types (`spec.md` §4.1).
//!
//! All multi-byte integers are big-endian, written with `byteorder` the way
//! `other_examples` parse binary protocol headers.

use std::io::Cursor;

use byteorder::{
    BigEndian,
    ReadBytesExt,
    WriteBytesExt,
};

use crate::{
    Error,
    PeerId,
    Sequence,
    BASE_HEADER_SIZE,
};

const TYPE_CONTROL: u8 = 0;
const TYPE_ORIGINAL: u8 = 1;
const TYPE_SPLIT: u8 = 2;
const TYPE_RELIABLE: u8 = 3;

const CONTROLTYPE_ACK: u8 = 0;
const CONTROLTYPE_SET_PEER_ID: u8 = 1;
const CONTROLTYPE_PING: u8 = 2;
const CONTROLTYPE_DISCO: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseHeader {
    pub protocol_id: u32,
    pub sender_peer_id: PeerId,
    pub channel: u8,
}

impl BaseHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.write_u32::<BigEndian>(self.protocol_id).unwrap();
        out.write_u16::<BigEndian>(self.sender_peer_id).unwrap();
        out.write_u8(self.channel).unwrap();
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8]), Error> {
        if bytes.len() < BASE_HEADER_SIZE {
            return Err(Error::InvalidIncomingData("datagram shorter than base header"));
        }
        let mut cursor = Cursor::new(bytes);
        let protocol_id = cursor.read_u32::<BigEndian>().unwrap();
        let sender_peer_id = cursor.read_u16::<BigEndian>().unwrap();
        let channel = cursor.read_u8().unwrap();
        Ok((
            BaseHeader {
                protocol_id,
                sender_peer_id,
                channel,
            },
            &bytes[BASE_HEADER_SIZE ..],
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlType {
    Ack(Sequence),
    SetPeerId(PeerId),
    Ping,
    Disco,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlType),
    Original(Vec<u8>),
    Split {
        split_seqnum: u16,
        chunk_count: u16,
        chunk_num: u16,
        data: Vec<u8>,
    },
    Reliable {
        seqnum: Sequence,
        inner: Box<Frame>,
    },
}

impl Frame {
    /// Encodes this frame's type-specific header and payload. Does not
    /// include the base header.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            Frame::Control(control) => {
                out.write_u8(TYPE_CONTROL).unwrap();
                match control {
                    ControlType::Ack(seqnum) => {
                        out.write_u8(CONTROLTYPE_ACK).unwrap();
                        out.write_u16::<BigEndian>(*seqnum).unwrap();
                    },
                    ControlType::SetPeerId(peer_id) => {
                        out.write_u8(CONTROLTYPE_SET_PEER_ID).unwrap();
                        out.write_u16::<BigEndian>(*peer_id).unwrap();
                    },
                    ControlType::Ping => {
                        out.write_u8(CONTROLTYPE_PING).unwrap();
                    },
                    ControlType::Disco => {
                        out.write_u8(CONTROLTYPE_DISCO).unwrap();
                    },
                }
            },
            Frame::Original(payload) => {
                out.write_u8(TYPE_ORIGINAL).unwrap();
                out.extend_from_slice(payload);
            },
            Frame::Split {
                split_seqnum,
                chunk_count,
                chunk_num,
                data,
            } => {
                out.write_u8(TYPE_SPLIT).unwrap();
                out.write_u16::<BigEndian>(*split_seqnum).unwrap();
                out.write_u16::<BigEndian>(*chunk_count).unwrap();
                out.write_u16::<BigEndian>(*chunk_num).unwrap();
                out.extend_from_slice(data);
            },
            Frame::Reliable { seqnum, inner } => {
                if matches!(inner.as_ref(), Frame::Reliable { .. }) {
                    return Err(Error::InvalidIncomingData("nested RELIABLE frame"));
                }
                out.write_u8(TYPE_RELIABLE).unwrap();
                out.write_u16::<BigEndian>(*seqnum).unwrap();
                inner.encode(out)?;
            },
        }
        Ok(())
    }

    /// Decodes a type-specific frame (base header already stripped).
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(bytes);
        let frame_type = cursor
            .read_u8()
            .map_err(|_| Error::InvalidIncomingData("missing frame type byte"))?;

        match frame_type {
            TYPE_CONTROL => {
                let controltype = cursor
                    .read_u8()
                    .map_err(|_| Error::InvalidIncomingData("missing controltype byte"))?;
                let control = match controltype {
                    CONTROLTYPE_ACK => {
                        let seqnum = cursor
                            .read_u16::<BigEndian>()
                            .map_err(|_| Error::InvalidIncomingData("truncated ACK"))?;
                        ControlType::Ack(seqnum)
                    },
                    CONTROLTYPE_SET_PEER_ID => {
                        let peer_id = cursor
                            .read_u16::<BigEndian>()
                            .map_err(|_| Error::InvalidIncomingData("truncated SET_PEER_ID"))?;
                        ControlType::SetPeerId(peer_id)
                    },
                    CONTROLTYPE_PING => ControlType::Ping,
                    CONTROLTYPE_DISCO => ControlType::Disco,
                    _ => return Err(Error::InvalidIncomingData("unknown controltype")),
                };
                Ok(Frame::Control(control))
            },
            TYPE_ORIGINAL => {
                let pos = cursor.position() as usize;
                Ok(Frame::Original(bytes[pos ..].to_vec()))
            },
            TYPE_SPLIT => {
                let split_seqnum = cursor
                    .read_u16::<BigEndian>()
                    .map_err(|_| Error::InvalidIncomingData("truncated SPLIT header"))?;
                let chunk_count = cursor
                    .read_u16::<BigEndian>()
                    .map_err(|_| Error::InvalidIncomingData("truncated SPLIT header"))?;
                let chunk_num = cursor
                    .read_u16::<BigEndian>()
                    .map_err(|_| Error::InvalidIncomingData("truncated SPLIT header"))?;
                let pos = cursor.position() as usize;
                Ok(Frame::Split {
                    split_seqnum,
                    chunk_count,
                    chunk_num,
                    data: bytes[pos ..].to_vec(),
                })
            },
            TYPE_RELIABLE => {
                let seqnum = cursor
                    .read_u16::<BigEndian>()
                    .map_err(|_| Error::InvalidIncomingData("truncated RELIABLE header"))?;
                let pos = cursor.position() as usize;
                let inner = Frame::decode(&bytes[pos ..])?;
                if matches!(inner, Frame::Reliable { .. }) {
                    return Err(Error::InvalidIncomingData("nested RELIABLE frame"));
                }
                Ok(Frame::Reliable {
                    seqnum,
                    inner: Box::new(inner),
                })
            },
            _ => Err(Error::InvalidIncomingData("unknown frame type")),
        }
    }
}

/// Builds a complete datagram: base header followed by the encoded frame.
pub fn encode_datagram(header: &BaseHeader, frame: &Frame) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(BASE_HEADER_SIZE + 16);
    header.encode(&mut out);
    frame.encode(&mut out)?;
    Ok(out)
}

/// Parses a complete datagram into its base header and frame.
pub fn decode_datagram(bytes: &[u8]) -> Result<(BaseHeader, Frame), Error> {
    let (header, rest) = BaseHeader::decode(bytes)?;
    let frame = Frame::decode(rest)?;
    Ok((header, frame))
}

/// Fragments `payload` into a sequence of SPLIT frames of at most
/// `chunk_size` payload bytes each, sharing `split_seqnum`.
pub fn make_split(payload: &[u8], chunk_size: usize, split_seqnum: u16) -> Vec<Frame> {
    assert!(chunk_size > 0);
    let chunk_count = payload.chunks(chunk_size).count().max(1) as u16;
    payload
        .chunks(chunk_size.max(1))
        .enumerate()
        .map(|(i, chunk)| Frame::Split {
            split_seqnum,
            chunk_count,
            chunk_num: i as u16,
            data: chunk.to_vec(),
        })
        .collect()
}

/// Returns a singleton `[Frame::Original]` if `payload` fits under
/// `fits_max` (the budget left for a 0-extra-header ORIGINAL frame),
/// otherwise a SPLIT sequence chunked at `chunk_max` bytes, incrementing
/// `split_seqnum`.
pub fn auto_split(payload: &[u8], fits_max: usize, chunk_max: usize, split_seqnum: &mut u16) -> Vec<Frame> {
    if payload.len() <= fits_max {
        vec![Frame::Original(payload.to_vec())]
    } else {
        let frames = make_split(payload, chunk_max, *split_seqnum);
        *split_seqnum = split_seqnum.wrapping_add(1);
        frames
    }
}

/// Wraps `frame` as RELIABLE with the given sequence number. Fails if
/// `frame` is itself already a RELIABLE frame.
pub fn make_reliable(frame: Frame, seqnum: Sequence) -> Result<Frame, Error> {
    if matches!(frame, Frame::Reliable { .. }) {
        return Err(Error::InvalidIncomingData("nested RELIABLE frame"));
    }
    Ok(Frame::Reliable {
        seqnum,
        inner: Box::new(frame),
    })
}
