//! sio - single-threaded I/O reactor dan RPC
//!
//! Layer:
//! - `core`: Buffer dan timer heap
//! - `network`: Reactor (mio), TCP Stream, UDP Datagram
//! - `protocol`: header 24 byte + framing
//! - `rpc`: client/server request-response

pub mod core;
pub mod error;
pub mod network;
pub mod protocol;
pub mod rpc;

pub use error::{Result, RpcError, SioError};
pub use network::{Reactor, Stream, StreamEvent};
pub use rpc::{CallOptions, ClientConfig, ResponseHandle, RpcClient, RpcServer};
