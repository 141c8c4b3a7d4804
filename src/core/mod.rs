//! Core module: struktur data untuk reactor
//!
//! Prinsip desain:
//! - Growable buffer dengan compaction sebelum realloc
//! - Timer heap dengan handle ber-generation (aman dari handle basi)
//! - Tidak ada shared state, semua dipakai dari satu thread reactor

mod buffer;
mod timer_heap;

pub use buffer::{Buffer, BASE_CAPACITY, SHRINK_THRESHOLD};
pub use timer_heap::{TimerHeap, TimerKey};
