//! OpenIGTLink version 1 `TRANSFORM` messages.
//!
//! ```text
//! header (58 bytes, big-endian)
//!   u16      version            = 1
//!   [u8;12]  type name          = "TRANSFORM", NUL padded
//!   [u8;20]  device name        = channel, NUL padded
//!   u64      timestamp          seconds << 32 | fraction of a second * 2^32
//!   u64      body size          = 48
//!   u64      CRC-64/ECMA-182 of the body
//! body (48 bytes)
//!   12 × f32: R11 R21 R31 R12 R22 R32 R13 R23 R33 TX TY TZ
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use nalgebra::{Matrix3, Vector3};

use crate::error::NavError;
use crate::geometry::SE3;

pub const VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 58;
pub const TRANSFORM_BODY_SIZE: usize = 48;
pub const MESSAGE_SIZE: usize = HEADER_SIZE + TRANSFORM_BODY_SIZE;
pub const DEFAULT_PORT: u16 = 18944;

const TYPE_NAME: &str = "TRANSFORM";
const TYPE_FIELD: usize = 12;
const DEVICE_FIELD: usize = 20;

/// CRC-64/ECMA-182 generator polynomial (non-reflected, zero init and xorout).
const CRC64_POLY: u64 = 0x42F0_E1EB_A9EA_3693;

const CRC64_TABLE: [u64; 256] = build_crc64_table();

const fn build_crc64_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u64) << 56;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & (1 << 63) != 0 {
                (crc << 1) ^ CRC64_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

pub fn crc64(data: &[u8]) -> u64 {
    data.iter().fold(0u64, |crc, &byte| {
        CRC64_TABLE[(((crc >> 56) as u8) ^ byte) as usize] ^ (crc << 8)
    })
}

/// Device name of a transform stream; receivers key scene nodes on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName(String);

impl ChannelName {
    /// 1 to 20 printable ASCII bytes.
    pub fn new(name: &str) -> Result<Self, NavError> {
        let valid = !name.is_empty()
            && name.len() <= DEVICE_FIELD
            && name.bytes().all(|b| b.is_ascii_graphic() || b == b' ');
        if !valid {
            return Err(NavError::InvalidChannelName(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current wall-clock time in the OpenIGTLink fixed-point format.
pub fn timestamp_now() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let seconds = since_epoch.as_secs() & 0xFFFF_FFFF;
    let fraction = ((since_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (seconds << 32) | fraction
}

/// Serialize a transform with the given timestamp.
pub fn encode_transform(channel: &ChannelName, transform: &SE3, timestamp: u64) -> Vec<u8> {
    let body = encode_body(transform);

    let mut msg = Vec::with_capacity(MESSAGE_SIZE);
    msg.extend_from_slice(&VERSION.to_be_bytes());
    push_padded(&mut msg, TYPE_NAME.as_bytes(), TYPE_FIELD);
    push_padded(&mut msg, channel.as_str().as_bytes(), DEVICE_FIELD);
    msg.extend_from_slice(&timestamp.to_be_bytes());
    msg.extend_from_slice(&(TRANSFORM_BODY_SIZE as u64).to_be_bytes());
    msg.extend_from_slice(&crc64(&body).to_be_bytes());
    msg.extend_from_slice(&body);
    msg
}

fn encode_body(transform: &SE3) -> Vec<u8> {
    let r = transform.rotation_matrix();
    let t = transform.translation;
    let mut body = Vec::with_capacity(TRANSFORM_BODY_SIZE);
    for col in 0..3 {
        for row in 0..3 {
            body.extend_from_slice(&(r[(row, col)] as f32).to_be_bytes());
        }
    }
    for i in 0..3 {
        body.extend_from_slice(&(t[i] as f32).to_be_bytes());
    }
    body
}

fn push_padded(buf: &mut Vec<u8>, text: &[u8], width: usize) {
    let n = text.len().min(width);
    buf.extend_from_slice(&text[..n]);
    buf.resize(buf.len() + width - n, 0);
}

/// A decoded `TRANSFORM` message.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformMessage {
    pub device_name: String,
    pub timestamp: u64,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

/// Parse and verify a complete `TRANSFORM` message.
pub fn decode_transform(msg: &[u8]) -> Result<TransformMessage, NavError> {
    let bad = |what: &str| NavError::InvalidTransform(format!("OpenIGTLink message: {}", what));

    if msg.len() < HEADER_SIZE {
        return Err(bad("truncated header"));
    }
    let version = u16::from_be_bytes([msg[0], msg[1]]);
    if version != VERSION {
        return Err(bad("unsupported version"));
    }
    let type_name = trim_nul(&msg[2..2 + TYPE_FIELD]);
    if type_name != TYPE_NAME {
        return Err(bad("not a TRANSFORM message"));
    }
    let device_name = trim_nul(&msg[14..14 + DEVICE_FIELD]);
    let timestamp = read_u64(&msg[34..42]);
    let body_size = read_u64(&msg[42..50]) as usize;
    let crc = read_u64(&msg[50..58]);

    if body_size != TRANSFORM_BODY_SIZE || msg.len() != HEADER_SIZE + body_size {
        return Err(bad("unexpected body size"));
    }
    let body = &msg[HEADER_SIZE..];
    if crc64(body) != crc {
        return Err(bad("CRC mismatch"));
    }

    let values: Vec<f64> = body
        .chunks_exact(4)
        .map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64)
        .collect();
    let rotation = Matrix3::from_column_slice(&values[..9]);
    let translation = Vector3::new(values[9], values[10], values[11]);

    Ok(TransformMessage {
        device_name,
        timestamp,
        rotation,
        translation,
    })
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
