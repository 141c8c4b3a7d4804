//! UDP datagram socket di atas Reactor
//!
//! Setiap datagram yang masuk langsung diserahkan ke handler bersama
//! alamat pengirimnya; tidak ada buffering antar datagram.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use mio::net::UdpSocket;
use tracing::{debug, trace};

use super::reactor::{FdHandle, IoEvent, Reactor};
use crate::error::{Result, SioError};

/// Ukuran area receive per datagram
pub const DATAGRAM_CAPACITY: usize = 4096;

/// SO_SNDBUF / SO_RCVBUF untuk socket datagram (1 MiB)
const SOCKET_BUFFER_SIZE: libc::c_int = 1024 * 1024;

/// Handler: (reactor, socket, alamat pengirim, payload)
pub type DatagramHandler = Rc<dyn Fn(&mut Reactor, &Datagram, SocketAddr, &[u8])>;

struct DatagramInner {
    socket: Option<UdpSocket>,
    handle: Option<FdHandle>,
    recv_buf: Box<[u8]>,
    handler: Option<DatagramHandler>,
}

/// UDP socket yang terdaftar di reactor
#[derive(Clone)]
pub struct Datagram {
    inner: Rc<RefCell<DatagramInner>>,
}

impl Datagram {
    /// Bind ke `addr` dan mulai watch read
    pub fn open<F>(reactor: &mut Reactor, addr: SocketAddr, handler: F) -> Result<Datagram>
    where
        F: Fn(&mut Reactor, &Datagram, SocketAddr, &[u8]) + 'static,
    {
        let socket = UdpSocket::bind(addr)?;
        set_buffer_sizes(&socket);

        let dgram = Datagram {
            inner: Rc::new(RefCell::new(DatagramInner {
                socket: Some(socket),
                handle: None,
                recv_buf: vec![0u8; DATAGRAM_CAPACITY].into_boxed_slice(),
                handler: Some(Rc::new(handler)),
            })),
        };
        dgram.attach(reactor)?;
        debug!(addr = %addr, "datagram socket open");
        Ok(dgram)
    }

    /// Kirim satu datagram. Tidak ada antrian: WouldBlock dikembalikan ke pemanggil.
    pub fn send_to(&self, addr: SocketAddr, data: &[u8]) -> Result<usize> {
        let inner = self.inner.borrow();
        let socket = inner.socket.as_ref().ok_or(SioError::Closed)?;
        Ok(socket.send_to(data, addr)?)
    }

    /// Balas ke pengirim datagram yang sedang diproses
    #[inline]
    pub fn respond(&self, source: SocketAddr, data: &[u8]) -> Result<usize> {
        self.send_to(source, data)
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&mut Reactor, &Datagram, SocketAddr, &[u8]) + 'static,
    {
        let old = self.inner.borrow_mut().handler.replace(Rc::new(handler));
        drop(old);
    }

    pub fn attach(&self, reactor: &mut Reactor) -> Result<()> {
        let fd = {
            let inner = self.inner.borrow();
            if inner.handle.is_some() {
                return Ok(());
            }
            inner.socket.as_ref().ok_or(SioError::Closed)?.as_raw_fd()
        };

        let dgram = self.clone();
        let handle = reactor.add(fd, move |reactor, _, event| {
            if event == IoEvent::Read {
                dgram.read_ready(reactor);
            }
        })?;
        if let Err(e) = reactor.watch_read(handle) {
            reactor.del(handle);
            return Err(e);
        }
        self.inner.borrow_mut().handle = Some(handle);
        Ok(())
    }

    pub fn detach(&self, reactor: &mut Reactor) {
        let handle = self.inner.borrow_mut().handle.take();
        if let Some(handle) = handle {
            reactor.del(handle);
        }
    }

    pub fn close(&self, reactor: &mut Reactor) {
        self.detach(reactor);
        let (socket, handler) = {
            let mut inner = self.inner.borrow_mut();
            (inner.socket.take(), inner.handler.take())
        };
        drop(handler);
        drop(socket);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().socket.is_none()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let inner = self.inner.borrow();
        Ok(inner.socket.as_ref().ok_or(SioError::Closed)?.local_addr()?)
    }

    fn read_ready(&self, reactor: &mut Reactor) {
        loop {
            let received = {
                let mut guard = self.inner.borrow_mut();
                let inner = &mut *guard;
                let Some(socket) = inner.socket.as_ref() else {
                    return;
                };
                match socket.recv_from(&mut inner.recv_buf) {
                    Ok((n, source)) => Some((source, inner.recv_buf[..n].to_vec())),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => None,
                    Err(e) => {
                        debug!(error = %e, "recv_from failed");
                        None
                    }
                }
            };

            let Some((source, payload)) = received else {
                return;
            };
            trace!(%source, len = payload.len(), "datagram");

            let handler = self.inner.borrow().handler.clone();
            if let Some(handler) = handler {
                handler(reactor, self, source, &payload);
            }
            if self.inner.borrow().handle.is_none() {
                return;
            }
        }
    }
}

fn set_buffer_sizes(socket: &UdpSocket) {
    let fd = socket.as_raw_fd();
    let optval: libc::c_int = SOCKET_BUFFER_SIZE;
    // Ignore errors: kernel boleh membatasi ukuran buffer
    // SAFETY: fd milik `socket` yang masih hidup selama panggilan ini;
    // optval menunjuk c_int di stack dan panjangnya size_of::<c_int>()
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
