//! Reactor: single-threaded fd multiplexer + timer heap
//!
//! Menggunakan mio (epoll/kqueue) dengan `SourceFd`, jadi fd apa pun bisa
//! di-watch, bukan hanya socket milik mio.
//!
//! Satu iterasi `run`:
//! 1. Timer yang sudah jatuh tempo (dibatasi jumlah timer di awal step)
//! 2. Poll, timeout = min(permintaan, timer berikutnya, 1 detik)
//! 3. Dispatch: Read, lalu Write, lalu Error per descriptor
//! 4. Free descriptor yang di-`del` selama dispatch
//!
//! mio bersifat edge-triggered: handler wajib membaca/menulis
//! sampai `WouldBlock`.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::pipe;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace, warn};

use crate::core::{TimerHeap, TimerKey};
use crate::error::{Result, SioError};

/// Maksimum event per batch
const EVENTS_CAPACITY: usize = 64;

/// Batas atas waktu blok di dalam poll
const MAX_WAIT: Duration = Duration::from_secs(1);

/// Delay yang melewati batas `Instant` diparkir sejauh ini (100 tahun)
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Event yang dikirim ke handler descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    Read,
    Write,
    /// Hangup atau error pada socket
    Error,
}

/// Handler untuk satu descriptor
pub type IoHandler = Box<dyn FnMut(&mut Reactor, FdHandle, IoEvent)>;

/// Callback timer, dipanggil sekali
pub type TimerCallback = Box<dyn FnOnce(&mut Reactor)>;

/// Handle ke descriptor yang terdaftar (slot + generation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdHandle {
    slot: u32,
    generation: u32,
}

impl FdHandle {
    #[inline(always)]
    fn token(self) -> Token {
        Token(((self.generation as usize) << 32) | self.slot as usize)
    }

    #[inline(always)]
    fn from_token(token: Token) -> Self {
        Self {
            slot: (token.0 & 0xFFFF_FFFF) as u32,
            generation: (token.0 >> 32) as u32,
        }
    }
}

/// Handle ke timer yang sedang berjalan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(TimerKey);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Watch {
    read: bool,
    write: bool,
}

impl Watch {
    fn interest(self) -> Option<Interest> {
        match (self.read, self.write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

struct Watched {
    fd: RawFd,
    watch: Watch,
    // mio tidak mengenal interest kosong: deregister saat mask kosong
    registered: bool,
    // None selama handler sedang dipanggil
    handler: Option<IoHandler>,
    removed: bool,
}

struct FdSlot {
    generation: u32,
    watched: Option<Watched>,
}

#[derive(Clone, Copy)]
struct Ready {
    token: Token,
    readable: bool,
    writable: bool,
    failed: bool,
}

/// Handle thread-safe untuk membangunkan reactor dari thread lain
#[derive(Clone)]
pub struct ReactorWaker {
    sender: Arc<pipe::Sender>,
}

impl ReactorWaker {
    /// Tulis satu byte ke self-pipe. Pipe penuh berarti wakeup sudah pending.
    pub fn wake(&self) -> io::Result<()> {
        loop {
            match (&*self.sender).write(&[0u8]) {
                Ok(_) => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Single-threaded callback reactor
pub struct Reactor {
    poll: Poll,
    events: Events,
    ready: Vec<Ready>,
    slots: Vec<FdSlot>,
    free: Vec<u32>,
    live: usize,
    dispatching: bool,
    deferred: Vec<FdHandle>,
    timers: TimerHeap<TimerCallback>,
    wake_rx: pipe::Receiver,
    wake_tx: Arc<pipe::Sender>,
    wake_handle: Option<FdHandle>,
}

impl Reactor {
    /// Buat reactor baru: poller + self-pipe untuk wakeup.
    ///
    /// SIGPIPE di-ignore supaya write ke socket yang sudah ditutup peer
    /// menjadi `EPIPE` dan bukan terminasi proses.
    pub fn new() -> Result<Self> {
        ignore_sigpipe();

        let poll = Poll::new()?;
        let (wake_tx, wake_rx) = pipe::new()?;

        let mut reactor = Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            ready: Vec::with_capacity(EVENTS_CAPACITY),
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            dispatching: false,
            deferred: Vec::new(),
            timers: TimerHeap::new(),
            wake_rx,
            wake_tx: Arc::new(wake_tx),
            wake_handle: None,
        };

        let wake_fd = reactor.wake_rx.as_raw_fd();
        let handle = reactor.add(wake_fd, |reactor, _, _| reactor.drain_wake_pipe())?;
        reactor.watch_read(handle)?;
        reactor.wake_handle = Some(handle);

        Ok(reactor)
    }

    /// Daftarkan fd dengan watch mask kosong
    pub fn add<F>(&mut self, fd: RawFd, handler: F) -> Result<FdHandle>
    where
        F: FnMut(&mut Reactor, FdHandle, IoEvent) + 'static,
    {
        // SAFETY: F_GETFD hanya membaca flag descriptor
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
            return Err(SioError::Registration(io::Error::last_os_error()));
        }

        let watched = Watched {
            fd,
            watch: Watch::default(),
            registered: false,
            handler: Some(Box::new(handler)),
            removed: false,
        };

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize].watched = Some(watched);
                slot
            }
            None => {
                self.slots.push(FdSlot {
                    generation: 0,
                    watched: Some(watched),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.live += 1;

        let handle = FdHandle {
            slot,
            generation: self.slots[slot as usize].generation,
        };
        trace!(fd, slot, "descriptor added");
        Ok(handle)
    }

    /// Ganti handler. Aman dipanggil dari dalam handler descriptor itu sendiri.
    pub fn set<F>(&mut self, handle: FdHandle, handler: F)
    where
        F: FnMut(&mut Reactor, FdHandle, IoEvent) + 'static,
    {
        if let Some(watched) = self.watched_mut(handle) {
            watched.handler = Some(Box::new(handler));
        }
    }

    /// Hapus descriptor. Di tengah dispatch, storage baru di-free setelah batch.
    pub fn del(&mut self, handle: FdHandle) {
        let dispatching = self.dispatching;
        let registry = self.poll.registry();

        let Some(watched) = self
            .slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.watched.as_mut())
            .filter(|w| !w.removed)
        else {
            return;
        };

        if watched.registered {
            if let Err(e) = registry.deregister(&mut SourceFd(&watched.fd)) {
                // fd mungkin sudah ditutup oleh pemiliknya
                trace!(fd = watched.fd, error = %e, "deregister failed");
            }
            watched.registered = false;
        }
        trace!(fd = watched.fd, slot = handle.slot, dispatching, "descriptor removed");

        if dispatching {
            watched.removed = true;
            watched.watch = Watch::default();
            self.deferred.push(handle);
        } else {
            self.release(handle);
        }
    }

    pub fn watch_read(&mut self, handle: FdHandle) -> Result<()> {
        self.update_watch(handle, |w| w.read = true)
    }

    pub fn unwatch_read(&mut self, handle: FdHandle) -> Result<()> {
        self.update_watch(handle, |w| w.read = false)
    }

    pub fn watch_write(&mut self, handle: FdHandle) -> Result<()> {
        self.update_watch(handle, |w| w.write = true)
    }

    pub fn unwatch_write(&mut self, handle: FdHandle) -> Result<()> {
        self.update_watch(handle, |w| w.write = false)
    }

    /// Raw fd milik handle yang masih hidup
    pub fn fd(&self, handle: FdHandle) -> Option<RawFd> {
        self.watched(handle).map(|w| w.fd)
    }

    /// Apakah handle masih menunjuk descriptor yang terdaftar
    pub fn contains(&self, handle: FdHandle) -> bool {
        self.watched(handle).is_some()
    }

    /// Jumlah descriptor hidup, termasuk self-pipe internal
    #[inline(always)]
    pub fn descriptor_count(&self) -> usize {
        self.live
    }

    #[inline(always)]
    pub fn is_dispatching(&self) -> bool {
        self.dispatching
    }

    /// Satu iterasi event loop. Mengembalikan jumlah event I/O yang di-dispatch.
    pub fn run(&mut self, timeout: Duration) -> Result<usize> {
        self.run_timers();

        let wait = self.wait_timeout(timeout);
        match self.poll.poll(&mut self.events, Some(wait)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        // Salin event dulu: handler butuh &mut self
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        ready.extend(self.events.iter().map(|event| Ready {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            failed: event.is_error() || (event.is_read_closed() && event.is_write_closed()),
        }));

        self.dispatching = true;
        let mut dispatched = 0;
        for r in &ready {
            let handle = FdHandle::from_token(r.token);

            if r.readable && self.is_watching(handle, |w| w.read) {
                self.dispatch(handle, IoEvent::Read);
                dispatched += 1;
            }
            if r.writable && self.is_watching(handle, |w| w.write) {
                self.dispatch(handle, IoEvent::Write);
                dispatched += 1;
            }
            if r.failed && self.watched(handle).is_some() {
                self.dispatch(handle, IoEvent::Error);
                dispatched += 1;
            }
        }
        self.dispatching = false;
        self.ready = ready;

        for handle in std::mem::take(&mut self.deferred) {
            self.release(handle);
        }

        Ok(dispatched)
    }

    /// Bangunkan reactor yang sedang blok di `run`
    pub fn wakeup(&self) -> io::Result<()> {
        self.waker().wake()
    }

    /// Waker yang bisa dikirim ke thread lain
    pub fn waker(&self) -> ReactorWaker {
        ReactorWaker {
            sender: Arc::clone(&self.wake_tx),
        }
    }

    /// Jalankan `callback` sekali setelah `delay`
    pub fn start_timer<F>(&mut self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce(&mut Reactor) + 'static,
    {
        let expiry = expiry_after(Instant::now(), delay);
        TimerHandle(self.timers.insert(expiry, Box::new(callback)))
    }

    /// Batalkan timer. `false` kalau timer sudah jalan atau sudah dibatalkan.
    pub fn stop_timer(&mut self, handle: TimerHandle) -> bool {
        self.timers.remove(handle.0).is_some()
    }

    #[inline(always)]
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Timer yang jatuh tempo, maksimal sebanyak isi heap di awal step
    fn run_timers(&mut self) {
        let now = Instant::now();
        let bound = self.timers.len();

        for _ in 0..bound {
            match self.timers.top() {
                Some((_, expiry)) if expiry <= now => {}
                _ => break,
            }
            if let Some((_, _, callback)) = self.timers.pop() {
                callback(self);
            }
        }
    }

    fn wait_timeout(&self, requested: Duration) -> Duration {
        let mut wait = requested.min(MAX_WAIT);
        if let Some((_, expiry)) = self.timers.top() {
            wait = wait.min(expiry.saturating_duration_since(Instant::now()));
        }
        wait
    }

    fn dispatch(&mut self, handle: FdHandle, event: IoEvent) {
        let Some(mut handler) = self.watched_mut(handle).and_then(|w| w.handler.take()) else {
            return;
        };

        handler(self, handle, event);

        // Kembalikan handler kecuali sudah di-`set` atau di-`del`
        if let Some(watched) = self.watched_mut(handle) {
            if watched.handler.is_none() {
                watched.handler = Some(handler);
            }
        }
    }

    fn drain_wake_pipe(&mut self) {
        let mut buf = [0u8; 1024];
        loop {
            match self.wake_rx.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "wake pipe read failed");
                    break;
                }
            }
        }
    }

    fn update_watch(&mut self, handle: FdHandle, change: impl FnOnce(&mut Watch)) -> Result<()> {
        let registry = self.poll.registry();
        let watched = self
            .slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.watched.as_mut())
            .filter(|w| !w.removed)
            .ok_or(SioError::StaleHandle)?;

        let before = watched.watch;
        change(&mut watched.watch);
        if watched.watch == before && (watched.registered || before.interest().is_none()) {
            return Ok(());
        }

        let mut source = SourceFd(&watched.fd);
        let result = match (watched.watch.interest(), watched.registered) {
            (Some(interest), true) => registry.reregister(&mut source, handle.token(), interest),
            (Some(interest), false) => registry.register(&mut source, handle.token(), interest),
            (None, true) => registry.deregister(&mut source),
            (None, false) => Ok(()),
        };

        if let Err(e) = result {
            watched.watch = before;
            debug!(fd = watched.fd, error = %e, "watch update rejected");
            return Err(SioError::Registration(e));
        }
        watched.registered = watched.watch.interest().is_some();
        Ok(())
    }

    fn release(&mut self, handle: FdHandle) {
        if let Some(slot) = self.slots.get_mut(handle.slot as usize) {
            if slot.generation == handle.generation && slot.watched.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(handle.slot);
                self.live -= 1;
            }
        }
    }

    fn is_watching(&self, handle: FdHandle, pick: impl FnOnce(&Watch) -> bool) -> bool {
        self.watched(handle).map_or(false, |w| pick(&w.watch))
    }

    fn watched(&self, handle: FdHandle) -> Option<&Watched> {
        self.slots
            .get(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.watched.as_ref())
            .filter(|w| !w.removed)
    }

    fn watched_mut(&mut self, handle: FdHandle) -> Option<&mut Watched> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.watched.as_mut())
            .filter(|w| !w.removed)
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if let Some(handle) = self.wake_handle.take() {
            self.del(handle);
        }
    }
}

fn ignore_sigpipe() {
    // SAFETY: sigaction dengan SIG_IGN, tanpa handler custom
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_IGN;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGPIPE, &action, std::ptr::null_mut());
    }
}

/// `now + delay`, jenuh ke `FAR_FUTURE` kalau overflow
pub(crate) fn expiry_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    fn socket_pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn test_add_rejects_invalid_fd() {
        let mut reactor = Reactor::new().unwrap();
        let result = reactor.add(-1, |_, _, _| {});
        assert!(matches!(result, Err(SioError::Registration(_))));
    }

    #[test]
    fn test_read_dispatch() {
        let mut reactor = Reactor::new().unwrap();
        let (a, mut b) = socket_pair();
        let reads = Rc::new(Cell::new(0));

        let counter = Rc::clone(&reads);
        let handle = reactor
            .add(a.as_raw_fd(), move |_, _, event| {
                if event == IoEvent::Read {
                    counter.set(counter.get() + 1);
                }
            })
            .unwrap();

        // belum di-watch: tidak ada dispatch
        b.write_all(b"x").unwrap();
        reactor.run(Duration::from_millis(20)).unwrap();
        assert_eq!(reads.get(), 0);

        reactor.watch_read(handle).unwrap();
        reactor.run(Duration::from_millis(200)).unwrap();
        assert_eq!(reads.get(), 1);
    }

    #[test]
    fn test_self_delete_not_invoked_again() {
        let mut reactor = Reactor::new().unwrap();
        let (a, mut b) = socket_pair();
        let calls = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&calls);
        let handle = reactor
            .add(a.as_raw_fd(), move |reactor, handle, event| {
                log.borrow_mut().push(event);
                reactor.del(handle);
                // del kedua kali tidak boleh panic
                reactor.del(handle);
                assert!(reactor.watch_write(handle).is_err());
            })
            .unwrap();
        reactor.watch_read(handle).unwrap();
        reactor.watch_write(handle).unwrap();

        b.write_all(b"x").unwrap();
        reactor.run(Duration::from_millis(200)).unwrap();

        // Read dan Write ready bersamaan, tapi hanya Read yang dipanggil
        assert_eq!(*calls.borrow(), vec![IoEvent::Read]);
        assert!(!reactor.contains(handle));
        assert_eq!(reactor.descriptor_count(), 1);
    }

    #[test]
    fn test_delete_other_descriptor_mid_batch() {
        let mut reactor = Reactor::new().unwrap();
        let (a1, mut b1) = socket_pair();
        let (a2, mut b2) = socket_pair();
        let fired = Rc::new(Cell::new(0));
        let peers: Rc<RefCell<Vec<FdHandle>>> = Rc::new(RefCell::new(Vec::new()));

        for fd in [a1.as_raw_fd(), a2.as_raw_fd()] {
            let fired = Rc::clone(&fired);
            let peers_in = Rc::clone(&peers);
            let handle = reactor
                .add(fd, move |reactor, me, _| {
                    fired.set(fired.get() + 1);
                    let others: Vec<FdHandle> =
                        peers_in.borrow().iter().copied().filter(|h| *h != me).collect();
                    for other in others {
                        reactor.del(other);
                    }
                })
                .unwrap();
            reactor.watch_read(handle).unwrap();
            peers.borrow_mut().push(handle);
        }

        b1.write_all(b"x").unwrap();
        b2.write_all(b"x").unwrap();
        // siapa pun yang jalan duluan menghapus yang lain
        reactor.run(Duration::from_millis(200)).unwrap();

        assert_eq!(fired.get(), 1);
        assert_eq!(reactor.descriptor_count(), 2);
        let alive = peers.borrow().iter().filter(|h| reactor.contains(**h)).count();
        assert_eq!(alive, 1);
    }

    #[test]
    fn test_set_replaces_handler_from_inside() {
        let mut reactor = Reactor::new().unwrap();
        let (a, mut b) = socket_pair();
        let marks = Rc::new(RefCell::new(Vec::new()));

        let first = Rc::clone(&marks);
        let second = Rc::clone(&marks);
        let handle = reactor
            .add(a.as_raw_fd(), move |reactor, handle, _| {
                first.borrow_mut().push("first");
                let second = Rc::clone(&second);
                reactor.set(handle, move |_, _, _| second.borrow_mut().push("second"));
            })
            .unwrap();
        reactor.watch_read(handle).unwrap();

        b.write_all(b"x").unwrap();
        reactor.run(Duration::from_millis(200)).unwrap();
        b.write_all(b"y").unwrap();
        reactor.run(Duration::from_millis(200)).unwrap();

        assert_eq!(*marks.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn test_timers_fire_in_order() {
        let mut reactor = Reactor::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (delay, tag) in [(30u64, 'c'), (10, 'a'), (20, 'b')] {
            let order = Rc::clone(&order);
            reactor.start_timer(Duration::from_millis(delay), move |_| {
                order.borrow_mut().push(tag)
            });
        }
        let cancelled = {
            let order = Rc::clone(&order);
            reactor.start_timer(Duration::from_millis(15), move |_| {
                order.borrow_mut().push('x')
            })
        };
        assert!(reactor.stop_timer(cancelled));
        assert!(!reactor.stop_timer(cancelled));

        let deadline = Instant::now() + Duration::from_secs(2);
        while reactor.timer_count() > 0 && Instant::now() < deadline {
            reactor.run(Duration::from_millis(50)).unwrap();
        }
        assert_eq!(*order.borrow(), vec!['a', 'b', 'c']);
    }

    #[test]
    fn test_unbounded_delay_is_parked() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        let timer = reactor.start_timer(Duration::MAX, move |_| flag.set(true));
        assert_eq!(reactor.timer_count(), 1);

        reactor.run(Duration::ZERO).unwrap();
        assert!(!fired.get());
        assert!(reactor.stop_timer(timer));
        assert_eq!(reactor.timer_count(), 0);
    }

    #[test]
    fn test_zero_delay_rearm_is_bounded() {
        fn rearm(reactor: &mut Reactor, count: Rc<Cell<u32>>) {
            count.set(count.get() + 1);
            reactor.start_timer(Duration::ZERO, move |reactor| rearm(reactor, count));
        }

        let mut reactor = Reactor::new().unwrap();
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        reactor.start_timer(Duration::ZERO, move |reactor| rearm(reactor, c));

        reactor.run(Duration::ZERO).unwrap();
        assert_eq!(count.get(), 1);
        reactor.run(Duration::ZERO).unwrap();
        assert_eq!(count.get(), 2);
        assert_eq!(reactor.timer_count(), 1);
    }

    #[test]
    fn test_wait_capped_by_next_timer() {
        let mut reactor = Reactor::new().unwrap();
        reactor.start_timer(Duration::from_millis(30), |_| {});

        let start = Instant::now();
        reactor.run(Duration::from_secs(10)).unwrap();
        assert!(start.elapsed() < Duration::from_millis(900));
    }

    #[test]
    fn test_wakeup_from_other_thread() {
        let mut reactor = Reactor::new().unwrap();
        let waker = reactor.waker();

        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker.wake().unwrap();
        });

        let start = Instant::now();
        // 1 detik adalah cap; wakeup harus memotongnya
        let dispatched = reactor.run(Duration::from_secs(5)).unwrap();
        thread.join().unwrap();

        assert_eq!(dispatched, 1);
        assert!(start.elapsed() < Duration::from_millis(900));
    }
}
