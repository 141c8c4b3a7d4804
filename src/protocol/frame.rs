//! Framing `[header][body]` di atas byte stream
//!
//! Decoder membaca frame lengkap saja; frame parsial tetap di buffer
//! sampai byte sisanya datang.

use super::header::{RpcHeader, WireError, HEADER_SIZE};

/// Encode satu frame lengkap (header dengan body_len = body.len())
pub fn encode_frame(id: u64, kind: u32, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&RpcHeader::new(id, kind, body.len() as u32).to_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Zero-copy frame decoder
pub struct FrameDecoder<'a> {
    buffer: &'a [u8],
    read_pos: usize,
}

impl<'a> FrameDecoder<'a> {
    #[inline(always)]
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            read_pos: 0,
        }
    }

    /// Frame lengkap berikutnya.
    ///
    /// `Ok(None)` berarti sisa buffer belum berisi frame utuh.
    /// `Err(BadMagic)` berarti stream rusak dan koneksi harus ditutup.
    #[inline]
    pub fn next_frame(&mut self) -> Result<Option<(RpcHeader, &'a [u8])>, WireError> {
        let rest = &self.buffer[self.read_pos..];
        if rest.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = RpcHeader::decode(rest)?;
        let frame_len = header.frame_len();
        if rest.len() < frame_len {
            return Ok(None);
        }

        self.read_pos += frame_len;
        Ok(Some((header, &rest[HEADER_SIZE..frame_len])))
    }

    /// Byte yang sudah dikonsumsi frame lengkap
    #[inline(always)]
    pub fn consumed(&self) -> usize {
        self.read_pos
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.read_pos
    }
}
