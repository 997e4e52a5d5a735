//! Framing for the two halves of a peer connection: the one-shot handshake
//! and the subsequent length-prefixed message stream.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, PeerId, Sha1Hash, BLOCK_LEN};

/// Sanity cap on a single message frame's length, to bound how much a
/// misbehaving or malicious peer can make us buffer before we've even
/// looked at the message id.
const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// The protocol string sent in every handshake, as mandated by BEP 3.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The handshake message, the very first thing sent and received on a peer
/// connection, before any other message.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Length of the handshake message, in bytes: 1 (pstrlen) + 19 (pstr) + 8
/// (reserved) + 20 (info hash) + 20 (peer id).
const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 1 {
            return Ok(None);
        }
        let pstrlen = buf[0] as usize;
        if pstrlen != 19 {
            return Err(Error::ProtocolViolation(format!(
                "invalid handshake pstrlen {}",
                pstrlen
            )));
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::ProtocolViolation(
                "invalid handshake protocol string".into(),
            ));
        }
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The message types exchanged after the handshake (BEP 3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Block { index: u32, begin: u32, data: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl MessageId {
    fn from_u8(id: u8) -> Result<Self, Error> {
        Ok(match id {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Block,
            8 => Self::Cancel,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unknown message id {}",
                    other
                )))
            }
        })
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index);
            }
            Message::Bitfield(bytes) => {
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(index);
                buf.put_u32(begin);
                buf.put_u32(length);
            }
            Message::Block { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(index);
                buf.put_u32(begin);
                buf.put_slice(&data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(index);
                buf.put_u32(begin);
                buf.put_u32(length);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;

        if len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if len > MAX_MESSAGE_LEN {
            return Err(Error::ProtocolViolation(format!(
                "message length {} exceeds sane bound",
                len
            )));
        }

        if buf.len() < 4 + len {
            buf.reserve(4 + len - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let id = MessageId::from_u8(buf[0])?;
        buf.advance(1);
        let payload_len = len - 1;

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if payload_len != 4 {
                    return Err(Error::ProtocolViolation(
                        "have message has wrong length".into(),
                    ));
                }
                let piece_index = buf.get_u32();
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                let bytes = buf[..payload_len].to_vec();
                buf.advance(payload_len);
                Message::Bitfield(bytes)
            }
            MessageId::Request => {
                if payload_len != 12 {
                    return Err(Error::ProtocolViolation(
                        "request message has wrong length".into(),
                    ));
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let length = buf.get_u32();
                if length == 0 || length > BLOCK_LEN {
                    return Err(Error::ProtocolViolation(format!(
                        "request length {} out of bounds",
                        length
                    )));
                }
                Message::Request {
                    index,
                    begin,
                    length,
                }
            }
            MessageId::Block => {
                if payload_len < 8 {
                    return Err(Error::ProtocolViolation(
                        "block message too short".into(),
                    ));
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let data = buf[..payload_len - 8].to_vec();
                buf.advance(payload_len - 8);
                Message::Block { index, begin, data }
            }
            MessageId::Cancel => {
                if payload_len != 12 {
                    return Err(Error::ProtocolViolation(
                        "cancel message has wrong length".into(),
                    ));
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let length = buf.get_u32();
                Message::Cancel {
                    index,
                    begin,
                    length,
                }
            }
        };

        Ok(Some(msg))
    }
}
