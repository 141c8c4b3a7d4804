//! TCP Stream di atas Reactor
//!
//! Satu Stream = satu socket + dua Buffer + satu registrasi reactor.
//! Handle `Stream` adalah `Rc`, boleh di-clone bebas di thread reactor.
//!
//! Stream hidup sampai `close()`: registrasi di reactor memegang
//! referensi kuat ke Stream selama terdaftar.

use std::cell::{RefCell, RefMut};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use mio::net::{TcpListener, TcpStream};
use tracing::{debug, trace, warn};

use super::reactor::{FdHandle, IoEvent, Reactor};
use crate::core::Buffer;
use crate::error::{Result, SioError};

/// Ukuran satu kali read dari socket (4 KiB)
pub const READ_CHUNK: usize = 4096;

/// Jenis stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Listening,
    Connecting,
    Normal,
}

/// Event yang diterima user handler
pub enum StreamEvent {
    /// Koneksi baru dari listener, sudah terdaftar dan di-watch read
    Accept(Stream),
    /// Ada data baru di inbound buffer
    Data,
    /// Socket error atau connect gagal
    Error,
    /// Peer menutup koneksi
    Close,
}

impl fmt::Debug for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamEvent::Accept(_) => f.write_str("Accept"),
            StreamEvent::Data => f.write_str("Data"),
            StreamEvent::Error => f.write_str("Error"),
            StreamEvent::Close => f.write_str("Close"),
        }
    }
}

/// User handler, di-share antara listener dan stream hasil accept
pub type StreamHandler = Rc<dyn Fn(&mut Reactor, &Stream, StreamEvent)>;

enum Socket {
    Listener(TcpListener),
    Stream(TcpStream),
    Closed,
}

struct StreamInner {
    kind: StreamKind,
    socket: Socket,
    handle: Option<FdHandle>,
    input: Buffer,
    output: Buffer,
    handler: Option<StreamHandler>,
    closed: bool,
}

/// TCP connection atau listener
#[derive(Clone)]
pub struct Stream {
    inner: Rc<RefCell<StreamInner>>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Stream")
            .field("kind", &inner.kind)
            .field("closed", &inner.closed)
            .field("attached", &inner.handle.is_some())
            .field("pending", &inner.output.len())
            .finish()
    }
}

impl Stream {
    fn from_socket(kind: StreamKind, socket: Socket, handler: StreamHandler) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StreamInner {
                kind,
                socket,
                handle: None,
                input: Buffer::new(),
                output: Buffer::new(),
                handler: Some(handler),
                closed: false,
            })),
        }
    }

    /// Listen di `addr` (SO_REUSEADDR, nonblocking, backlog 1024).
    ///
    /// Koneksi hasil accept memakai handler yang sama dengan listener.
    pub fn listen<F>(reactor: &mut Reactor, addr: SocketAddr, handler: F) -> Result<Stream>
    where
        F: Fn(&mut Reactor, &Stream, StreamEvent) + 'static,
    {
        let listener = TcpListener::bind(addr)?;
        let stream = Self::from_socket(
            StreamKind::Listening,
            Socket::Listener(listener),
            Rc::new(handler),
        );
        stream.attach(reactor)?;
        debug!(addr = %addr, local = ?stream.local_addr().ok(), "listening");
        Ok(stream)
    }

    /// Nonblocking connect ke `addr`.
    ///
    /// Kalau connect belum selesai, stream berjenis Connecting dan
    /// write yang masuk di-queue sampai koneksi terbentuk.
    pub fn connect<F>(reactor: &mut Reactor, addr: SocketAddr, handler: F) -> Result<Stream>
    where
        F: Fn(&mut Reactor, &Stream, StreamEvent) + 'static,
    {
        Self::connect_shared(reactor, addr, Rc::new(handler))
    }

    /// Sama dengan `connect`, dengan handler yang sudah di-share
    pub fn connect_shared(
        reactor: &mut Reactor,
        addr: SocketAddr,
        handler: StreamHandler,
    ) -> Result<Stream> {
        let socket = TcpStream::connect(addr)?;
        socket.set_nodelay(true)?;

        // peer_addr sukses berarti connect selesai secara sinkron
        let kind = match socket.peer_addr() {
            Ok(_) => StreamKind::Normal,
            Err(_) => StreamKind::Connecting,
        };
        let stream = Self::from_socket(kind, Socket::Stream(socket), handler);
        stream.attach(reactor)?;
        trace!(addr = %addr, ?kind, "connect issued");
        Ok(stream)
    }

    /// Kirim data. Urutan byte selalu terjaga: kalau masih ada antrian
    /// atau connect belum selesai, data di-append ke outbound buffer.
    pub fn write(&self, reactor: &mut Reactor, data: &[u8]) -> Result<()> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        if inner.closed {
            return Err(SioError::Closed);
        }

        if !inner.output.is_empty() || inner.kind == StreamKind::Connecting {
            inner.output.append(data);
            return Ok(());
        }

        let Socket::Stream(socket) = &mut inner.socket else {
            return Err(SioError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "write on listening stream",
            )));
        };

        let written = loop {
            match socket.write(data) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break 0,
                Err(e) => return Err(e.into()),
            }
        };
        if written == data.len() {
            return Ok(());
        }

        inner.output.append(&data[written..]);
        if let Some(handle) = inner.handle {
            reactor.watch_write(handle)?;
        }
        Ok(())
    }

    /// Tutup socket, lepas registrasi dan buffer. Idempotent.
    pub fn close(&self, reactor: &mut Reactor) {
        let handler = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;
            if let Some(handle) = inner.handle.take() {
                reactor.del(handle);
            }
            // deregister dulu, baru fd ditutup
            inner.socket = Socket::Closed;
            inner.input = Buffer::with_capacity(0);
            inner.output = Buffer::with_capacity(0);
            inner.handler.take()
        };
        drop(handler);
        trace!("stream closed");
    }

    /// Lepas dari reactor tanpa menutup socket
    pub fn detach(&self, reactor: &mut Reactor) {
        let handle = self.inner.borrow_mut().handle.take();
        if let Some(handle) = handle {
            reactor.del(handle);
        }
    }

    /// Daftarkan ulang ke reactor sesuai jenis stream:
    /// Listening -> read, Connecting -> write, Normal -> read (+ write kalau ada antrian)
    pub fn attach(&self, reactor: &mut Reactor) -> Result<()> {
        let (fd, kind, queued) = {
            let inner = self.inner.borrow();
            if inner.closed {
                return Err(SioError::Closed);
            }
            if inner.handle.is_some() {
                return Ok(());
            }
            let fd = match &inner.socket {
                Socket::Listener(l) => l.as_raw_fd(),
                Socket::Stream(s) => s.as_raw_fd(),
                Socket::Closed => return Err(SioError::Closed),
            };
            (fd, inner.kind, !inner.output.is_empty())
        };

        let stream = self.clone();
        let handle = reactor.add(fd, move |reactor, _, event| on_io(reactor, &stream, event))?;

        let watched = match kind {
            StreamKind::Listening => reactor.watch_read(handle),
            StreamKind::Connecting => reactor.watch_write(handle),
            StreamKind::Normal => reactor.watch_read(handle).and_then(|_| {
                if queued {
                    reactor.watch_write(handle)
                } else {
                    Ok(())
                }
            }),
        };
        if let Err(e) = watched {
            reactor.del(handle);
            return Err(e);
        }

        self.inner.borrow_mut().handle = Some(handle);
        Ok(())
    }

    /// Ganti user handler
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&mut Reactor, &Stream, StreamEvent) + 'static,
    {
        self.set_shared_handler(Rc::new(handler));
    }

    pub fn set_shared_handler(&self, handler: StreamHandler) {
        let old = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.handler.replace(handler)
        };
        drop(old);
    }

    /// Inbound buffer; konsumsi data dengan `erase`
    pub fn input(&self) -> RefMut<'_, Buffer> {
        RefMut::map(self.inner.borrow_mut(), |inner| &mut inner.input)
    }

    /// Byte yang masih antri di outbound buffer
    #[inline]
    pub fn pending(&self) -> usize {
        self.inner.borrow().output.len()
    }

    #[inline]
    pub fn kind(&self) -> StreamKind {
        self.inner.borrow().kind
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.inner.borrow().handle.is_some()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.inner.borrow().socket {
            Socket::Listener(l) => Ok(l.local_addr()?),
            Socket::Stream(s) => Ok(s.local_addr()?),
            Socket::Closed => Err(SioError::Closed),
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        match &self.inner.borrow().socket {
            Socket::Stream(s) => Ok(s.peer_addr()?),
            Socket::Listener(_) => Err(SioError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "listening stream has no peer",
            ))),
            Socket::Closed => Err(SioError::Closed),
        }
    }
}

/// Panggil user handler tanpa memegang borrow apa pun
fn emit(reactor: &mut Reactor, stream: &Stream, event: StreamEvent) {
    let handler = {
        let inner = stream.inner.borrow();
        if inner.closed {
            return;
        }
        inner.handler.clone()
    };
    if let Some(handler) = handler {
        handler(reactor, stream, event);
    }
}

fn on_io(reactor: &mut Reactor, stream: &Stream, event: IoEvent) {
    let kind = {
        let inner = stream.inner.borrow();
        if inner.closed {
            return;
        }
        inner.kind
    };

    match (kind, event) {
        (StreamKind::Listening, IoEvent::Read) => accept_ready(reactor, stream),
        (StreamKind::Listening, _) => warn!(?event, "unexpected event on listener"),
        (StreamKind::Connecting, IoEvent::Write | IoEvent::Error) => connect_ready(reactor, stream),
        (StreamKind::Connecting, IoEvent::Read) => {}
        (StreamKind::Normal, IoEvent::Read) => read_ready(reactor, stream),
        (StreamKind::Normal, IoEvent::Write) => write_ready(reactor, stream),
        (StreamKind::Normal, IoEvent::Error) => emit(reactor, stream, StreamEvent::Error),
    }
}

fn accept_ready(reactor: &mut Reactor, listener: &Stream) {
    loop {
        let accepted = {
            let inner = listener.inner.borrow();
            match &inner.socket {
                Socket::Listener(l) => l.accept(),
                _ => return,
            }
        };

        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        };

        if let Err(e) = socket.set_nodelay(true) {
            debug!(%peer, error = %e, "set_nodelay failed");
        }

        let handler = {
            let inner = listener.inner.borrow();
            match inner.handler.clone() {
                Some(h) => h,
                None => return,
            }
        };

        let stream = Stream::from_socket(StreamKind::Normal, Socket::Stream(socket), handler);
        if let Err(e) = stream.attach(reactor) {
            warn!(%peer, error = %e, "register accepted stream failed");
            stream.close(reactor);
            continue;
        }
        debug!(%peer, "accepted");

        emit(reactor, listener, StreamEvent::Accept(stream));
        if listener.is_closed() {
            return;
        }
    }
}

fn connect_ready(reactor: &mut Reactor, stream: &Stream) {
    let outcome = {
        let inner = stream.inner.borrow();
        let Socket::Stream(socket) = &inner.socket else {
            return;
        };
        match socket.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => match socket.peer_addr() {
                Ok(peer) => Ok(Some(peer)),
                // belum selesai, tunggu event berikutnya
                Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(None),
                Err(e) => Err(e),
            },
        }
    };

    match outcome {
        Ok(None) => {}
        Ok(Some(peer)) => {
            let (handle, queued) = {
                let mut inner = stream.inner.borrow_mut();
                inner.kind = StreamKind::Normal;
                (inner.handle, !inner.output.is_empty())
            };
            trace!(%peer, queued, "connected");

            let Some(handle) = handle else { return };
            if let Err(e) = reactor.watch_read(handle) {
                warn!(error = %e, "watch_read after connect failed");
                emit(reactor, stream, StreamEvent::Error);
                return;
            }
            if queued {
                // sudah writable, edge berikutnya belum tentu datang
                write_ready(reactor, stream);
            } else if let Err(e) = reactor.unwatch_write(handle) {
                warn!(error = %e, "unwatch_write after connect failed");
            }
        }
        Err(e) => {
            debug!(error = %e, "connect failed");
            emit(reactor, stream, StreamEvent::Error);
        }
    }
}

enum ReadOutcome {
    Data,
    Drained,
    Closed,
    Failed(io::Error),
}

fn read_once(stream: &Stream) -> ReadOutcome {
    let mut guard = stream.inner.borrow_mut();
    let inner = &mut *guard;
    let Socket::Stream(socket) = &mut inner.socket else {
        return ReadOutcome::Drained;
    };

    inner.input.reserve(READ_CHUNK);
    loop {
        match socket.read(&mut inner.input.space_mut()[..READ_CHUNK]) {
            Ok(0) => return ReadOutcome::Closed,
            Ok(n) => {
                inner.input.seek(n);
                return ReadOutcome::Data;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Drained,
            Err(e) => return ReadOutcome::Failed(e),
        }
    }
}

/// Read pump: baca per 4 KiB sampai WouldBlock, emit Data per chunk
fn read_ready(reactor: &mut Reactor, stream: &Stream) {
    loop {
        match read_once(stream) {
            ReadOutcome::Data => {
                emit(reactor, stream, StreamEvent::Data);
                // handler boleh close/detach di tengah pump
                let inner = stream.inner.borrow();
                if inner.closed || inner.handle.is_none() {
                    return;
                }
            }
            ReadOutcome::Drained => return,
            ReadOutcome::Closed => {
                emit(reactor, stream, StreamEvent::Close);
                return;
            }
            ReadOutcome::Failed(e) => {
                debug!(error = %e, "read failed");
                emit(reactor, stream, StreamEvent::Error);
                return;
            }
        }
    }
}

/// Flush outbound buffer; write-watch dilepas begitu buffer kosong
fn write_ready(reactor: &mut Reactor, stream: &Stream) {
    let result = {
        let mut guard = stream.inner.borrow_mut();
        let inner = &mut *guard;
        let Socket::Stream(socket) = &mut inner.socket else {
            return;
        };

        let mut result = Ok(());
        while !inner.output.is_empty() {
            match socket.write(inner.output.data()) {
                Ok(0) => {
                    result = Err(io::Error::from(io::ErrorKind::WriteZero));
                    break;
                }
                Ok(n) => inner.output.erase(n),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        if result.is_ok() && inner.output.is_empty() {
            if let Some(handle) = inner.handle {
                if let Err(e) = reactor.unwatch_write(handle) {
                    debug!(error = %e, "unwatch_write failed");
                }
            }
        }
        result
    };

    if let Err(e) = result {
        debug!(error = %e, "write failed");
        emit(reactor, stream, StreamEvent::Error);
    }
}
