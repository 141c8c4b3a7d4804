//! RPC server: listener + dispatch per request type
//!
//! Setiap frame lengkap diserahkan ke handler yang terdaftar untuk tipe
//! request-nya, bersama `ResponseHandle`. Handler boleh menjawab langsung
//! atau menyimpan handle dan menjawab nanti dari timer/callback lain.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::error::{Result, RpcError};
use crate::network::{Reactor, Stream, StreamEvent, StreamHandler};
use crate::protocol::{FrameDecoder, RpcHeader};

/// Handler satu tipe request
pub type MethodHandler = Rc<dyn Fn(&mut Reactor, ResponseHandle)>;

struct ServerState {
    listener: Option<Stream>,
    local_addr: Option<SocketAddr>,
    methods: HashMap<u32, MethodHandler>,
    conns: HashMap<u64, Stream>,
    next_conn_id: u64,
    closed: bool,
}

/// RPC server. Clone berbagi state yang sama.
#[derive(Clone)]
pub struct RpcServer {
    state: Rc<RefCell<ServerState>>,
}

impl RpcServer {
    /// Listen di `addr` dan mulai menerima koneksi
    pub fn add_service(reactor: &mut Reactor, addr: SocketAddr) -> Result<RpcServer> {
        let state = Rc::new(RefCell::new(ServerState {
            listener: None,
            local_addr: None,
            methods: HashMap::new(),
            conns: HashMap::new(),
            next_conn_id: 0,
            closed: false,
        }));

        let weak = Rc::downgrade(&state);
        let listener = Stream::listen(reactor, addr, move |reactor, _, event| {
            on_listener_event(reactor, &weak, event)
        })?;

        {
            let mut st = state.borrow_mut();
            st.local_addr = listener.local_addr().ok();
            st.listener = Some(listener);
        }
        debug!(%addr, "rpc service started");
        Ok(RpcServer { state })
    }

    /// Daftarkan handler untuk `request_type`. Satu tipe hanya satu handler.
    pub fn register_protocol<F>(&self, request_type: u32, handler: F) -> std::result::Result<(), RpcError>
    where
        F: Fn(&mut Reactor, ResponseHandle) + 'static,
    {
        let mut state = self.state.borrow_mut();
        if state.methods.contains_key(&request_type) {
            return Err(RpcError::DuplicateMethod(request_type));
        }
        state.methods.insert(request_type, Rc::new(handler));
        trace!(request_type, "protocol registered");
        Ok(())
    }

    /// Tutup listener dan semua koneksi. Response yang datang setelahnya dibuang.
    pub fn close(&self, reactor: &mut Reactor) {
        let (listener, conns) = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            let conns: Vec<Stream> = state.conns.drain().map(|(_, conn)| conn).collect();
            (state.listener.take(), conns)
        };

        if let Some(listener) = listener {
            listener.close(reactor);
        }
        let count = conns.len();
        for conn in conns {
            conn.close(reactor);
        }
        debug!(connections = count, "rpc service closed");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.borrow().local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.state.borrow().conns.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}

/// Hak untuk menjawab satu request.
///
/// Dikonsumsi oleh `finish` atau `finish_without_response`, jadi satu
/// request paling banyak dijawab sekali.
pub struct ResponseHandle {
    server: Weak<RefCell<ServerState>>,
    conn_id: u64,
    header: RpcHeader,
    body: Vec<u8>,
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("conn_id", &self.conn_id)
            .field("header", &self.header)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl ResponseHandle {
    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.header.id
    }

    #[inline(always)]
    pub fn request_type(&self) -> u32 {
        self.header.kind
    }

    #[inline(always)]
    pub fn header(&self) -> &RpcHeader {
        &self.header
    }

    #[inline(always)]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[inline(always)]
    pub fn connection_id(&self) -> u64 {
        self.conn_id
    }

    /// Kirim response: id, tipe dan reserved sama dengan request.
    ///
    /// `false` kalau koneksinya sudah hilang; response dibuang tanpa error.
    pub fn finish(self, reactor: &mut Reactor, body: &[u8]) -> bool {
        let Some(state) = self.server.upgrade() else {
            return false;
        };
        let conn = state.borrow().conns.get(&self.conn_id).cloned();
        let Some(conn) = conn else {
            trace!(conn_id = self.conn_id, id = self.header.id, "connection gone, response dropped");
            return false;
        };

        let header = RpcHeader {
            body_len: body.len() as u32,
            ..self.header
        };
        let mut frame = Vec::with_capacity(header.frame_len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(body);

        match conn.write(reactor, &frame) {
            Ok(()) => true,
            Err(e) => {
                debug!(conn_id = self.conn_id, error = %e, "response write failed, closing connection");
                state.borrow_mut().conns.remove(&self.conn_id);
                conn.close(reactor);
                false
            }
        }
    }

    /// Lepas request tanpa menjawab; client akan timeout atau retry
    pub fn finish_without_response(self) {
        trace!(conn_id = self.conn_id, id = self.header.id, "request released without response");
    }
}

fn on_listener_event(reactor: &mut Reactor, server: &Weak<RefCell<ServerState>>, event: StreamEvent) {
    match event {
        StreamEvent::Accept(conn) => {
            let Some(state) = server.upgrade() else {
                conn.close(reactor);
                return;
            };
            let mut st = state.borrow_mut();
            if st.closed {
                drop(st);
                conn.close(reactor);
                return;
            }

            let conn_id = st.next_conn_id;
            st.next_conn_id += 1;
            conn.set_shared_handler(connection_handler(server.clone(), conn_id));
            debug!(conn_id, peer = ?conn.peer_addr().ok(), "rpc connection accepted");
            st.conns.insert(conn_id, conn);
        }
        StreamEvent::Error => warn!("listener error"),
        StreamEvent::Data | StreamEvent::Close => {}
    }
}

fn connection_handler(server: Weak<RefCell<ServerState>>, conn_id: u64) -> StreamHandler {
    Rc::new(move |reactor: &mut Reactor, stream: &Stream, event: StreamEvent| match event {
        StreamEvent::Data => on_request_data(reactor, &server, conn_id, stream),
        StreamEvent::Error | StreamEvent::Close => {
            drop_connection(reactor, &server, conn_id, stream);
            debug!(conn_id, "rpc connection closed");
        }
        StreamEvent::Accept(accepted) => accepted.close(reactor),
    })
}

fn drop_connection(reactor: &mut Reactor, server: &Weak<RefCell<ServerState>>, conn_id: u64, stream: &Stream) {
    if let Some(state) = server.upgrade() {
        state.borrow_mut().conns.remove(&conn_id);
    }
    stream.close(reactor);
}

fn on_request_data(reactor: &mut Reactor, server: &Weak<RefCell<ServerState>>, conn_id: u64, stream: &Stream) {
    let Some(state) = server.upgrade() else {
        stream.close(reactor);
        return;
    };

    let mut requests = Vec::new();
    let parsed = {
        let mut input = stream.input();
        let mut decoder = FrameDecoder::new(input.data());
        let parsed = loop {
            match decoder.next_frame() {
                Ok(Some((header, body))) => requests.push((header, body.to_vec())),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        let consumed = decoder.consumed();
        input.erase(consumed);
        parsed
    };

    if let Err(e) = parsed {
        warn!(conn_id, error = %e, "malformed request, closing connection");
        drop_connection(reactor, server, conn_id, stream);
        return;
    }

    for (header, body) in requests {
        let handler = state.borrow().methods.get(&header.kind).cloned();
        let Some(handler) = handler else {
            debug!(conn_id, request_type = header.kind, "no handler for request type");
            continue;
        };

        let response = ResponseHandle {
            server: server.clone(),
            conn_id,
            header,
            body,
        };
        handler(reactor, response);

        // handler boleh menutup server/koneksi
        if stream.is_closed() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_duplicate_protocol_rejected() {
        let mut reactor = Reactor::new().unwrap();
        let server = RpcServer::add_service(&mut reactor, loopback()).unwrap();

        assert!(server.register_protocol(7, |_, req| req.finish_without_response()).is_ok());
        let err = server
            .register_protocol(7, |_, req| req.finish_without_response())
            .unwrap_err();
        assert!(matches!(err, RpcError::DuplicateMethod(7)));
        assert!(server.register_protocol(8, |_, req| req.finish_without_response()).is_ok());
    }

    #[test]
    fn test_bind_conflict_is_error() {
        let mut reactor = Reactor::new().unwrap();
        let first = RpcServer::add_service(&mut reactor, loopback()).unwrap();
        let addr = first.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        assert!(RpcServer::add_service(&mut reactor, addr).is_err());
    }

    #[test]
    fn test_close_releases_listener() {
        let mut reactor = Reactor::new().unwrap();
        let before = reactor.descriptor_count();
        let server = RpcServer::add_service(&mut reactor, loopback()).unwrap();
        assert_eq!(reactor.descriptor_count(), before + 1);

        server.close(&mut reactor);
        server.close(&mut reactor);
        assert!(server.is_closed());
        assert_eq!(server.connection_count(), 0);
        assert_eq!(reactor.descriptor_count(), before);
    }
}
