//! Network Layer: single-threaded reactor + socket wrappers
//!
//! Menggunakan mio untuk epoll/kqueue, semua I/O non-blocking.
//!
//! Fitur:
//! - Reactor dengan handle ber-generation dan deferred free
//! - Timer heap terintegrasi di dalam reactor
//! - TCP Stream dengan buffered read/write
//! - UDP Datagram
//!
//! Satu-satunya operasi lintas thread adalah `ReactorWaker::wake`.

mod dgram;
mod reactor;
mod stream;

pub(crate) use reactor::expiry_after;
pub use dgram::{Datagram, DatagramHandler, DATAGRAM_CAPACITY};
pub use reactor::{
    FdHandle, IoEvent, IoHandler, Reactor, ReactorWaker, TimerCallback, TimerHandle,
};
pub use stream::{Stream, StreamEvent, StreamHandler, StreamKind, READ_CHUNK};
