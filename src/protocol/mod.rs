//! Protocol Layer: binary RPC framing
//!
//! Prinsip desain:
//! - Fixed-size header 24 byte, big-endian
//! - Magic number untuk deteksi stream rusak
//! - Decode langsung dari input buffer tanpa alokasi

mod frame;
mod header;

pub use frame::{encode_frame, FrameDecoder};
pub use header::{RpcHeader, WireError, HEADER_SIZE, MAGIC};
