//! RPC header, fixed 24 bytes big-endian
//!
//! Layout:
//! ┌──────────┬──────────┬──────────┬──────────┬──────────┐
//! │ id u64   │ type u32 │ magic u32│ rsvd u32 │ len u32  │
//! │ [0..8)   │ [8..12)  │ [12..16) │ [16..20) │ [20..24) │
//! └──────────┴──────────┴──────────┴──────────┴──────────┘
//!
//! Encode/decode field per field dengan `to_be_bytes`/`from_be_bytes`,
//! tidak pernah cast struct langsung dari buffer.

use thiserror::Error;

pub const HEADER_SIZE: usize = 24;
pub const MAGIC: u32 = 0xF2A1_C2CC;

/// Error decode header/frame
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Input lebih pendek dari header
    #[error("truncated header: need {HEADER_SIZE} bytes, got {0}")]
    Truncated(usize),

    /// Magic tidak cocok, koneksi harus diputus
    #[error("bad magic number: {0:#010x}")]
    BadMagic(u32),
}

/// Header satu frame RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RpcHeader {
    /// Correlation id, dipilih oleh client
    pub id: u64,
    /// Tipe request (method number)
    pub kind: u32,
    pub reserved: u32,
    /// Panjang body setelah header
    pub body_len: u32,
}

impl RpcHeader {
    #[inline(always)]
    pub fn new(id: u64, kind: u32, body_len: u32) -> Self {
        Self {
            id,
            kind,
            reserved: 0,
            body_len,
        }
    }

    /// Encode ke `out[..HEADER_SIZE]`
    #[inline]
    pub fn encode(&self, out: &mut [u8]) -> Result<(), WireError> {
        if out.len() < HEADER_SIZE {
            return Err(WireError::Truncated(out.len()));
        }
        out[..HEADER_SIZE].copy_from_slice(&self.to_bytes());
        Ok(())
    }

    #[inline]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..8].copy_from_slice(&self.id.to_be_bytes());
        out[8..12].copy_from_slice(&self.kind.to_be_bytes());
        out[12..16].copy_from_slice(&MAGIC.to_be_bytes());
        out[16..20].copy_from_slice(&self.reserved.to_be_bytes());
        out[20..24].copy_from_slice(&self.body_len.to_be_bytes());
        out
    }

    /// Decode dari awal `input`. Magic dicek lebih dulu.
    #[inline]
    pub fn decode(input: &[u8]) -> Result<Self, WireError> {
        if input.len() < HEADER_SIZE {
            return Err(WireError::Truncated(input.len()));
        }

        let magic = be_u32(&input[12..16]);
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&input[0..8]);

        Ok(Self {
            id: u64::from_be_bytes(id),
            kind: be_u32(&input[8..12]),
            reserved: be_u32(&input[16..20]),
            body_len: be_u32(&input[20..24]),
        })
    }

    /// Total ukuran frame (header + body)
    #[inline(always)]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.body_len as usize
    }
}

#[inline(always)]
fn be_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(raw)
}
