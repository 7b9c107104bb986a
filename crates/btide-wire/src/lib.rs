//! Fixed-size wire packet codec (`spec.md` §4.4).
//!
//! Every frame is exactly [`PAYLOAD_MAX`] bytes: a 4-byte header
//! (`msg_code` u16 big-endian, `error` u8, one reserved zero byte)
//! followed by a payload region zero-padded out to the frame size.
//! Unknown `msg_code` values unmarshal successfully; dispatch is left
//! to the caller, which ignores what it doesn't recognize.

use std::fmt;

use thiserror::Error;

/// Total on-wire frame size in bytes, header included. A deployment
/// constant shared by all peers (`spec.md` §6); callers construct
/// [`Codec`] with the value negotiated out-of-band (typically 4096).
pub const DEFAULT_PAYLOAD_MAX: usize = 4096;

/// Header width: 2 bytes `msg_code` + 1 byte `error` + 1 reserved byte.
pub const HEADER_LEN: usize = 4;

/// Length in bytes of a hex-encoded identifier or hash field embedded
/// in a payload.
const IDENT_HEX_LEN: usize = 32;
const HASH_HEX_LEN: usize = 64;

/// Message codes (`spec.md` §4.4).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MsgCode {
    /// Announce presence (handshake, outbound).
    Acp,
    /// Acknowledge (handshake, inbound reply).
    Ack,
    /// Disconnect.
    Dsn,
    /// Chunk request.
    Req,
    /// Chunk response.
    Res,
    /// Ping.
    Png,
    /// Pong.
    Pog,
    /// Anything else; dispatch ignores it.
    Unknown(u16),
}

impl MsgCode {
    #[must_use]
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Acp => 1,
            Self::Ack => 2,
            Self::Dsn => 3,
            Self::Req => 4,
            Self::Res => 5,
            Self::Png => 6,
            Self::Pog => 7,
            Self::Unknown(code) => code,
        }
    }

    #[must_use]
    pub fn from_u16(code: u16) -> Self {
        match code {
            1 => Self::Acp,
            2 => Self::Ack,
            3 => Self::Dsn,
            4 => Self::Req,
            5 => Self::Res,
            6 => Self::Png,
            7 => Self::Pog,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for MsgCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acp => write!(f, "ACP"),
            Self::Ack => write!(f, "ACK"),
            Self::Dsn => write!(f, "DSN"),
            Self::Req => write!(f, "REQ"),
            Self::Res => write!(f, "RES"),
            Self::Png => write!(f, "PNG"),
            Self::Pog => write!(f, "POG"),
            Self::Unknown(code) => write!(f, "UNKNOWN({code})"),
        }
    }
}

/// Payload of a `REQ` packet: the chunk being requested.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReqPayload {
    pub ident: String,
    pub chunk_hash: String,
    pub offset: u32,
    pub size: u32,
}

/// Payload of a `RES` packet. `data` is empty on error (`spec.md`
/// §4.4: "on error, `size = 0` and `data` absent").
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResPayload {
    pub ident: String,
    pub chunk_hash: String,
    pub offset: u32,
    pub size: u32,
    pub data: Vec<u8>,
}

/// A decoded packet: header plus typed payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Packet {
    Acp,
    Ack,
    Dsn,
    Req(ReqPayload),
    Res { error: u8, payload: Option<ResPayload> },
    Png,
    Pog,
    Unknown(u16),
}

impl Packet {
    #[must_use]
    pub fn msg_code(&self) -> MsgCode {
        match self {
            Self::Acp => MsgCode::Acp,
            Self::Ack => MsgCode::Ack,
            Self::Dsn => MsgCode::Dsn,
            Self::Req(_) => MsgCode::Req,
            Self::Res { .. } => MsgCode::Res,
            Self::Png => MsgCode::Png,
            Self::Pog => MsgCode::Pog,
            Self::Unknown(code) => MsgCode::Unknown(*code),
        }
    }
}

/// Failures from marshalling or unmarshalling a packet.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame must be exactly {expected} bytes, got {actual}")]
    WrongFrameSize { expected: usize, actual: usize },

    #[error("payload for {0} exceeds the negotiated frame size")]
    PayloadTooLarge(MsgCode),

    #[error("truncated payload for {0}: needed {needed} bytes, had {available}")]
    TruncatedPayload {
        msg_code: MsgCode,
        needed: usize,
        available: usize,
    },

    #[error("payload for {0} is not valid UTF-8/hex")]
    MalformedField(MsgCode),
}

/// A fixed frame-size codec. Construct once per deployment with the
/// negotiated `PAYLOAD_MAX` and reuse across every session.
#[derive(Clone, Copy, Debug)]
pub struct Codec {
    frame_size: usize,
}

impl Codec {
    #[must_use]
    pub fn new(frame_size: usize) -> Self {
        Self { frame_size }
    }

    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Encode `pkt` into a `frame_size`-byte buffer, zero-padded.
    pub fn marshal(&self, pkt: &Packet) -> Result<Vec<u8>, CodecError> {
        let mut body = Vec::new();
        let error = match pkt {
            Packet::Res { error, payload } => {
                if let Some(p) = payload {
                    encode_res_body(&mut body, p);
                }
                *error
            }
            Packet::Req(p) => {
                encode_req_body(&mut body, p);
                0
            }
            _ => 0,
        };

        if HEADER_LEN + body.len() > self.frame_size {
            return Err(CodecError::PayloadTooLarge(pkt.msg_code()));
        }

        let mut frame = vec![0_u8; self.frame_size];
        let code = pkt.msg_code().to_u16();
        frame[0..2].copy_from_slice(&code.to_be_bytes());
        frame[2] = error;
        frame[3] = 0;
        frame[HEADER_LEN..HEADER_LEN + body.len()].copy_from_slice(&body);

        Ok(frame)
    }

    /// Decode a `frame_size`-byte buffer into a [`Packet`]. Unknown
    /// `msg_code` values decode to [`Packet::Unknown`] rather than
    /// erroring (`spec.md` §4.4).
    pub fn unmarshal(&self, frame: &[u8]) -> Result<Packet, CodecError> {
        if frame.len() != self.frame_size {
            return Err(CodecError::WrongFrameSize {
                expected: self.frame_size,
                actual: frame.len(),
            });
        }

        let code = u16::from_be_bytes([frame[0], frame[1]]);
        let error = frame[2];
        let body = &frame[HEADER_LEN..];
        let msg_code = MsgCode::from_u16(code);

        let pkt = match msg_code {
            MsgCode::Acp => Packet::Acp,
            MsgCode::Ack => Packet::Ack,
            MsgCode::Dsn => Packet::Dsn,
            MsgCode::Png => Packet::Png,
            MsgCode::Pog => Packet::Pog,
            MsgCode::Req => Packet::Req(decode_req_body(body, msg_code)?),
            MsgCode::Res => {
                if error == 0 {
                    Packet::Res {
                        error,
                        payload: Some(decode_res_body(body, msg_code)?),
                    }
                } else {
                    Packet::Res {
                        error,
                        payload: None,
                    }
                }
            }
            MsgCode::Unknown(raw) => Packet::Unknown(raw),
        };
        Ok(pkt)
    }
}

fn encode_req_body(out: &mut Vec<u8>, p: &ReqPayload) {
    out.extend_from_slice(p.ident.as_bytes());
    out.extend_from_slice(p.chunk_hash.as_bytes());
    out.extend_from_slice(&p.offset.to_be_bytes());
    out.extend_from_slice(&p.size.to_be_bytes());
}

fn decode_req_body(body: &[u8], msg_code: MsgCode) -> Result<ReqPayload, CodecError> {
    let needed = IDENT_HEX_LEN + HASH_HEX_LEN + 4 + 4;
    if body.len() < needed {
        return Err(CodecError::TruncatedPayload {
            msg_code,
            needed,
            available: body.len(),
        });
    }
    let mut cursor = 0;
    let ident = take_hex_field(body, &mut cursor, IDENT_HEX_LEN, msg_code)?;
    let chunk_hash = take_hex_field(body, &mut cursor, HASH_HEX_LEN, msg_code)?;
    let offset = take_u32(body, &mut cursor);
    let size = take_u32(body, &mut cursor);
    Ok(ReqPayload {
        ident,
        chunk_hash,
        offset,
        size,
    })
}

fn encode_res_body(out: &mut Vec<u8>, p: &ResPayload) {
    out.extend_from_slice(p.ident.as_bytes());
    out.extend_from_slice(p.chunk_hash.as_bytes());
    out.extend_from_slice(&p.offset.to_be_bytes());
    out.extend_from_slice(&p.size.to_be_bytes());
    out.extend_from_slice(&p.data);
}

fn decode_res_body(body: &[u8], msg_code: MsgCode) -> Result<ResPayload, CodecError> {
    let header_needed = IDENT_HEX_LEN + HASH_HEX_LEN + 4 + 4;
    if body.len() < header_needed {
        return Err(CodecError::TruncatedPayload {
            msg_code,
            needed: header_needed,
            available: body.len(),
        });
    }
    let mut cursor = 0;
    let ident = take_hex_field(body, &mut cursor, IDENT_HEX_LEN, msg_code)?;
    let chunk_hash = take_hex_field(body, &mut cursor, HASH_HEX_LEN, msg_code)?;
    let offset = take_u32(body, &mut cursor);
    let size = take_u32(body, &mut cursor);

    let size_usize = size as usize;
    if body.len() < cursor + size_usize {
        return Err(CodecError::TruncatedPayload {
            msg_code,
            needed: cursor + size_usize,
            available: body.len(),
        });
    }
    let data = body[cursor..cursor + size_usize].to_vec();

    Ok(ResPayload {
        ident,
        chunk_hash,
        offset,
        size,
        data,
    })
}

fn take_hex_field(
    body: &[u8],
    cursor: &mut usize,
    len: usize,
    msg_code: MsgCode,
) -> Result<String, CodecError> {
    let slice = &body[*cursor..*cursor + len];
    *cursor += len;
    std::str::from_utf8(slice)
        .map(str::to_owned)
        .map_err(|_| CodecError::MalformedField(msg_code))
}

fn take_u32(body: &[u8], cursor: &mut usize) -> u32 {
    let value = u32::from_be_bytes([body[*cursor], body[*cursor + 1], body[*cursor + 2], body[*cursor + 3]]);
    *cursor += 4;
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Codec {
        Codec::new(DEFAULT_PAYLOAD_MAX)
    }

    #[test]
    fn round_trips_empty_payload_packets() {
        let c = codec();
        for pkt in [Packet::Acp, Packet::Ack, Packet::Dsn, Packet::Png, Packet::Pog] {
            let frame = c.marshal(&pkt).unwrap();
            assert_eq!(frame.len(), DEFAULT_PAYLOAD_MAX);
            let decoded = c.unmarshal(&frame).unwrap();
            assert_eq!(decoded, pkt);
        }
    }

    #[test]
    fn round_trips_req() {
        let c = codec();
        let req = ReqPayload {
            ident: "a".repeat(32),
            chunk_hash: "b".repeat(64),
            offset: 16,
            size: 16,
        };
        let pkt = Packet::Req(req.clone());
        let frame = c.marshal(&pkt).unwrap();
        let decoded = c.unmarshal(&frame).unwrap();
        assert_eq!(decoded, Packet::Req(req));
    }

    #[test]
    fn round_trips_res_with_data() {
        let c = codec();
        let res = ResPayload {
            ident: "a".repeat(32),
            chunk_hash: "b".repeat(64),
            offset: 0,
            size: 4,
            data: vec![1, 2, 3, 4],
        };
        let pkt = Packet::Res {
            error: 0,
            payload: Some(res.clone()),
        };
        let frame = c.marshal(&pkt).unwrap();
        let decoded = c.unmarshal(&frame).unwrap();
        assert_eq!(decoded, Packet::Res { error: 0, payload: Some(res) });
    }

    #[test]
    fn res_error_has_no_payload() {
        let c = codec();
        let pkt = Packet::Res {
            error: 1,
            payload: None,
        };
        let frame = c.marshal(&pkt).unwrap();
        let decoded = c.unmarshal(&frame).unwrap();
        assert_eq!(decoded, Packet::Res { error: 1, payload: None });
    }

    #[test]
    fn unknown_msg_code_decodes_without_error() {
        let c = codec();
        let mut frame = vec![0_u8; DEFAULT_PAYLOAD_MAX];
        frame[0..2].copy_from_slice(&999_u16.to_be_bytes());
        let decoded = c.unmarshal(&frame).unwrap();
        assert_eq!(decoded, Packet::Unknown(999));
    }

    #[test]
    fn rejects_wrong_frame_size() {
        let c = codec();
        let err = c.unmarshal(&[0_u8; 10]).unwrap_err();
        assert!(matches!(err, CodecError::WrongFrameSize { .. }));
    }

    #[test]
    fn rejects_req_payload_too_large_for_frame() {
        let c = Codec::new(HEADER_LEN + 10);
        let req = ReqPayload {
            ident: "a".repeat(32),
            chunk_hash: "b".repeat(64),
            offset: 0,
            size: 0,
        };
        let err = c.marshal(&Packet::Req(req)).unwrap_err();
        assert!(matches!(err, CodecError::PayloadTooLarge(MsgCode::Req)));
    }
}
