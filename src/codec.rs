//! Tuya v3.3 wire codec
//!
//! Frames pack/unpack into typed `Command`/`Response`/`CommandKind` values
//! instead of an untyped `(seqno, cmd, retcode, payload)` tuple, so the rest
//! of the core gets sequence-number correlation and state-response dispatch
//! for free.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, block_padding::Pkcs7};
use std::fmt;

use crate::value::{Values, values_from_json, values_to_json};

type Aes128EcbEnc = ecb::Encryptor<aes::Aes128>;
type Aes128EcbDec = ecb::Decryptor<aes::Aes128>;

const AES_BLOCK_SIZE: usize = 16;

pub const PREFIX: u32 = 0x0000_55AA;
pub const SUFFIX: u32 = 0x0000_AA55;

const HEADER_SIZE: usize = 16; // prefix(4) + seqno(4) + cmd(4) + length(4)
const CRC_SIZE: usize = 4;
const SUFFIX_SIZE: usize = 4;
const FOOTER_SIZE: usize = CRC_SIZE + SUFFIX_SIZE;
const RETCODE_SIZE: usize = 4;

const VERSION_HEADER: [u8; 15] = *b"3.3\0\0\0\0\0\0\0\0\0\0\0\0";

/// Datapoint command/response frame codes.
const CODE_UPDATE: u32 = 7;
const CODE_STATUS: u32 = 8;
const CODE_HEARTBEAT: u32 = 9;
const CODE_STATE: u32 = 10;

/// Which command we originally sent — used as half of the Sender's Pending
/// key so responses correlate to the request that caused them. There is no
/// `Status` variant: Status(8) responses are never solicited by us, only
/// pushed by the device, so they never have a Pending waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Heartbeat,
    State,
    Update,
}

impl CommandKind {
    fn code(self) -> u32 {
        match self {
            CommandKind::Heartbeat => CODE_HEARTBEAT,
            CommandKind::State => CODE_STATE,
            CommandKind::Update => CODE_UPDATE,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    Heartbeat,
    State,
    Update(Values),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Heartbeat => CommandKind::Heartbeat,
            Command::State => CommandKind::State,
            Command::Update(_) => CommandKind::Update,
        }
    }

    fn payload_json(&self) -> serde_json::Value {
        match self {
            Command::Heartbeat | Command::State => serde_json::json!({}),
            Command::Update(values) => serde_json::json!({ "dps": values_to_json(values) }),
        }
    }
}

/// Frame kind as observed on the wire for an inbound response. `Status` only
/// ever appears here, never as a `CommandKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Update,
    Status,
    Heartbeat,
    State,
}

impl FrameKind {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            CODE_UPDATE => Some(FrameKind::Update),
            CODE_STATUS => Some(FrameKind::Status),
            CODE_HEARTBEAT => Some(FrameKind::Heartbeat),
            CODE_STATE => Some(FrameKind::State),
            _ => None,
        }
    }

    /// The `CommandKind` a response of this frame kind correlates to, if any.
    pub fn command_kind(self) -> Option<CommandKind> {
        match self {
            FrameKind::Update => Some(CommandKind::Update),
            FrameKind::Heartbeat => Some(CommandKind::Heartbeat),
            FrameKind::State => Some(CommandKind::State),
            FrameKind::Status => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseError(pub String);

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device returned an error: {}", self.0)
    }
}

impl std::error::Error for ResponseError {}

/// A parsed Tuya response. `values` is populated for `Status`/`State` frames
/// when the payload carries a `dps` object; its absence is itself an error
/// condition (a decode error) rather than silently empty.
#[derive(Debug, Clone)]
pub struct Response {
    pub kind: FrameKind,
    pub values: Option<Values>,
    pub error: Option<ResponseError>,
}

#[derive(Debug)]
pub enum CodecError {
    Encode(String),
    Decode(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(msg) => write!(f, "encode error: {msg}"),
            CodecError::Decode(msg) => write!(f, "decode error: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

pub struct Codec {
    key: [u8; 16],
}

impl Codec {
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }

    /// Pack a command into a complete wire frame.
    pub fn pack(&self, seq: u32, command: &Command) -> Result<Vec<u8>, CodecError> {
        let json = serde_json::to_vec(&command.payload_json())
            .map_err(|e| CodecError::Encode(format!("json serialize: {e}")))?;
        let encrypted = encrypt_payload(&json, &self.key);

        let mut payload_body = Vec::with_capacity(RETCODE_SIZE + VERSION_HEADER.len() + encrypted.len());
        payload_body.extend_from_slice(&0u32.to_be_bytes()); // return_code, always 0 outbound
        if matches!(command, Command::Update(_)) {
            payload_body.extend_from_slice(&VERSION_HEADER);
        }
        payload_body.extend_from_slice(&encrypted);

        let length = (payload_body.len() + FOOTER_SIZE) as u32;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload_body.len() + FOOTER_SIZE);
        frame.extend_from_slice(&PREFIX.to_be_bytes());
        frame.extend_from_slice(&seq.to_be_bytes());
        frame.extend_from_slice(&command.kind().code().to_be_bytes());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(&payload_body);

        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.extend_from_slice(&SUFFIX.to_be_bytes());

        Ok(frame)
    }

    /// Unpack a single complete wire frame (already split on its length
    /// prefix by Transport). The CRC is present in the frame but not
    /// recomputed here: inbound frames are trusted once the suffix matches.
    pub fn unpack(&self, data: &[u8]) -> Result<(u32, Response), CodecError> {
        if data.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(CodecError::Decode("short".into()));
        }

        let prefix = u32::from_be_bytes(data[0..4].try_into().unwrap());
        if prefix != PREFIX {
            return Err(CodecError::Decode("prefix".into()));
        }
        let seq = u32::from_be_bytes(data[4..8].try_into().unwrap());
        let code = u32::from_be_bytes(data[8..12].try_into().unwrap());
        let length = u32::from_be_bytes(data[12..16].try_into().unwrap()) as usize;

        if length < RETCODE_SIZE + FOOTER_SIZE {
            return Err(CodecError::Decode("short".into()));
        }
        let total = HEADER_SIZE + length;
        if data.len() < total {
            return Err(CodecError::Decode("short".into()));
        }

        let suffix_offset = total - SUFFIX_SIZE;
        let suffix = u32::from_be_bytes(data[suffix_offset..suffix_offset + 4].try_into().unwrap());
        if suffix != SUFFIX {
            return Err(CodecError::Decode("suffix".into()));
        }

        let kind = FrameKind::from_code(code).ok_or_else(|| CodecError::Decode("unknown".into()))?;

        let crc_offset = suffix_offset - CRC_SIZE;
        let return_code = u32::from_be_bytes(data[HEADER_SIZE..HEADER_SIZE + RETCODE_SIZE].try_into().unwrap());
        let body = &data[HEADER_SIZE + RETCODE_SIZE..crc_offset];

        if return_code != 0 {
            let text = String::from_utf8_lossy(body).into_owned();
            return Ok((
                seq,
                Response {
                    kind,
                    values: None,
                    error: Some(ResponseError(text)),
                },
            ));
        }

        if body.is_empty() {
            return Ok((
                seq,
                Response {
                    kind,
                    values: None,
                    error: None,
                },
            ));
        }

        let ciphertext = if body.len() >= 3 && &body[..3] == b"3.3" && body.len() >= VERSION_HEADER.len() {
            &body[VERSION_HEADER.len()..]
        } else {
            body
        };

        let decrypted = decrypt_payload(ciphertext, &self.key)
            .map_err(|_| CodecError::Decode("decrypt".into()))?;
        let parsed: serde_json::Value = serde_json::from_slice(&decrypted)
            .map_err(|e| CodecError::Decode(format!("json parse: {e}")))?;

        let response = match kind {
            FrameKind::Status | FrameKind::State => {
                let dps = parsed.get("dps");
                match dps {
                    Some(v) if v.is_object() => Response {
                        kind,
                        values: Some(values_from_json(v)),
                        error: None,
                    },
                    _ => Response {
                        kind,
                        values: None,
                        error: Some(ResponseError("no dps".into())),
                    },
                }
            }
            FrameKind::Update | FrameKind::Heartbeat => Response {
                kind,
                values: None,
                error: None,
            },
        };

        Ok((seq, response))
    }
}

pub fn encrypt_payload(plaintext: &[u8], key: &[u8; 16]) -> Vec<u8> {
    let padded_len = (plaintext.len() / AES_BLOCK_SIZE + 1) * AES_BLOCK_SIZE;
    let mut buf = vec![0u8; padded_len];
    buf[..plaintext.len()].copy_from_slice(plaintext);

    Aes128EcbEnc::new(key.into())
        .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
        .expect("buffer is correctly sized for PKCS7 padding")
        .to_vec()
}

pub fn decrypt_payload(ciphertext: &[u8], key: &[u8; 16]) -> Result<Vec<u8>, ()> {
    let mut buf = ciphertext.to_vec();
    Aes128EcbDec::new(key.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map(|d| d.to_vec())
        .map_err(|_| ())
}
