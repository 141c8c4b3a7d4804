//! RPC Layer: request/response di atas Stream
//!
//! - Client: pool upstream, pemilihan least-pending, timeout + retry
//!   per call, reconnect dengan exponential backoff
//! - Server: dispatch per request type, response async lewat `ResponseHandle`
//!
//! Semua callback berjalan di thread reactor.

mod backoff;
mod client;
mod config;
mod server;

pub use backoff::{Link, LinkEvent, LinkState, ReconnectPolicy, Transition};
pub use client::{CallCallback, RpcClient};
pub use config::{CallOptions, ClientConfig};
pub use server::{MethodHandler, ResponseHandle, RpcServer};
