//! RPC client: pool upstream, timeout/retry, backoff reconnect
//!
//! Alur satu call:
//! 1. Request dibuat, timer per-percobaan dipasang
//! 2. Upstream dipilih (pending paling sedikit), frame dikirim,
//!    request dicatat di pending map upstream
//! 3. Response dengan id + tipe yang cocok -> callback `Ok(body)`
//! 4. Timer jalan duluan -> unbind, kirim ulang dengan id baru, atau
//!    callback `Err(Timeout)` kalau jatah retry habis
//!
//! Kegagalan koneksi tidak pernah sampai ke user: upstream di-reset,
//! request yang terikat kembali menunggu timer-nya masing-masing.
//! Callback setiap call dipanggil tepat satu kali.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::backoff::{Link, LinkEvent, LinkState};
use super::config::{CallOptions, ClientConfig};
use crate::error::RpcError;
use crate::network::{Reactor, Stream, StreamEvent, StreamHandler, StreamKind, TimerHandle};
use crate::protocol::{encode_frame, FrameDecoder};

/// Callback hasil call: body response atau `RpcError::Timeout`/`Shutdown`
pub type CallCallback = Box<dyn FnOnce(&mut Reactor, Result<Vec<u8>, RpcError>)>;

type RequestKey = u64;

struct Upstream {
    id: u64,
    addr: SocketAddr,
    stream: Option<Stream>,
    // naik setiap stream diganti; event dari stream lama diabaikan
    epoch: u64,
    // correlation id, mulai dari 0 di setiap koneksi baru
    next_id: u64,
    pending: HashMap<u64, RequestKey>,
    link: Link,
}

struct Request {
    kind: u32,
    body: Vec<u8>,
    retry_count: u32,
    retry_times: u32,
    timeout: Duration,
    // (upstream id, wire id) selama ada di pending map upstream
    bound: Option<(u64, u64)>,
    timer: Option<TimerHandle>,
    callback: CallCallback,
}

struct ClientState {
    me: Weak<RefCell<ClientState>>,
    config: ClientConfig,
    upstreams: Vec<Upstream>,
    rr_cursor: usize,
    requests: HashMap<RequestKey, Request>,
    next_key: RequestKey,
    next_upstream_id: u64,
    check_timer: Option<TimerHandle>,
    shut_down: bool,
}

/// RPC client. Clone berbagi state yang sama.
#[derive(Clone)]
pub struct RpcClient {
    state: Rc<RefCell<ClientState>>,
}

impl RpcClient {
    pub fn new(config: ClientConfig) -> Self {
        let state = Rc::new_cyclic(|me| {
            RefCell::new(ClientState {
                me: me.clone(),
                config,
                upstreams: Vec::new(),
                rr_cursor: 0,
                requests: HashMap::new(),
                next_key: 0,
                next_upstream_id: 0,
                check_timer: None,
                shut_down: false,
            })
        });
        Self { state }
    }

    /// Tambah upstream dan langsung mulai connect.
    /// Alamat yang sudah terdaftar diabaikan (`false`).
    pub fn add_upstream(&self, reactor: &mut Reactor, addr: SocketAddr) -> bool {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if state.shut_down || state.upstreams.iter().any(|u| u.addr == addr) {
            return false;
        }

        let id = state.next_upstream_id;
        state.next_upstream_id += 1;
        state.upstreams.push(Upstream {
            id,
            addr,
            stream: None,
            epoch: 0,
            next_id: 0,
            pending: HashMap::new(),
            link: Link::new(state.config.reconnect),
        });
        debug!(%addr, upstream = id, "upstream added");

        let idx = state.upstreams.len() - 1;
        state.connect(reactor, idx);
        state.arm_check(reactor);
        true
    }

    /// Hapus upstream. Request yang sedang menunggu di sana kembali ke timer-nya.
    pub fn remove_upstream(&self, reactor: &mut Reactor, addr: SocketAddr) -> bool {
        let mut state = self.state.borrow_mut();
        let Some(idx) = state.upstreams.iter().position(|u| u.addr == addr) else {
            return false;
        };
        state.reset(reactor, idx);
        state.upstreams.remove(idx);
        debug!(%addr, "upstream removed");
        true
    }

    /// Kirim request. `callback` dipanggil tepat sekali: dengan body response,
    /// atau `RpcError::Timeout` setelah `retry_times + 1` percobaan habis.
    pub fn call<F>(&self, reactor: &mut Reactor, options: CallOptions, body: &[u8], callback: F)
    where
        F: FnOnce(&mut Reactor, Result<Vec<u8>, RpcError>) + 'static,
    {
        let mut state = self.state.borrow_mut();
        if state.shut_down {
            drop(state);
            callback(reactor, Err(RpcError::Shutdown));
            return;
        }

        let key = state.next_key;
        state.next_key += 1;

        let weak = state.me.clone();
        let timer = reactor.start_timer(options.timeout, move |reactor| {
            on_call_timer(reactor, &weak, key)
        });

        state.requests.insert(
            key,
            Request {
                kind: options.request_type,
                body: body.to_vec(),
                retry_count: 0,
                retry_times: options.retry_times,
                timeout: options.timeout,
                bound: None,
                timer: Some(timer),
                callback: Box::new(callback),
            },
        );
        state.dispatch(reactor, key);
    }

    /// Tutup semua koneksi dan selesaikan semua call yang masih berjalan
    /// dengan `RpcError::Shutdown`.
    pub fn shutdown(&self, reactor: &mut Reactor) {
        let mut callbacks: Vec<(RequestKey, CallCallback)> = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            if state.shut_down {
                return;
            }
            state.shut_down = true;

            if let Some(timer) = state.check_timer.take() {
                reactor.stop_timer(timer);
            }
            for up in &mut state.upstreams {
                if let Some(stream) = up.stream.take() {
                    stream.close(reactor);
                }
                up.pending.clear();
                up.epoch += 1;
            }

            state
                .requests
                .drain()
                .map(|(key, req)| {
                    if let Some(timer) = req.timer {
                        reactor.stop_timer(timer);
                    }
                    (key, req.callback)
                })
                .collect()
        };

        debug!(outstanding = callbacks.len(), "rpc client shut down");
        callbacks.sort_by_key(|(key, _)| *key);
        for (_, callback) in callbacks {
            callback(reactor, Err(RpcError::Shutdown));
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.borrow().shut_down
    }

    pub fn upstream_count(&self) -> usize {
        self.state.borrow().upstreams.len()
    }

    /// Upstream dengan koneksi yang sudah established
    pub fn connected_upstreams(&self) -> usize {
        self.state
            .borrow()
            .upstreams
            .iter()
            .filter(|u| u.stream.as_ref().map_or(false, |s| s.kind() == StreamKind::Normal))
            .count()
    }

    /// Request yang sudah terkirim dan menunggu response
    pub fn pending_requests(&self) -> usize {
        self.state.borrow().upstreams.iter().map(|u| u.pending.len()).sum()
    }

    /// Call yang callback-nya belum dipanggil
    pub fn outstanding_calls(&self) -> usize {
        self.state.borrow().requests.len()
    }

    /// Delay backoff upstream untuk kegagalan berikutnya
    pub fn reconnect_delay(&self, addr: SocketAddr) -> Option<Duration> {
        let state = self.state.borrow();
        state.upstreams.iter().find(|u| u.addr == addr).map(|u| u.link.delay())
    }

    pub fn link_state(&self, addr: SocketAddr) -> Option<LinkState> {
        let state = self.state.borrow();
        state.upstreams.iter().find(|u| u.addr == addr).map(|u| u.link.state())
    }
}

impl ClientState {
    fn dispatch(&mut self, reactor: &mut Reactor, key: RequestKey) {
        match self.choose_upstream(reactor) {
            Some(idx) => {
                self.send(reactor, idx, key);
            }
            None => trace!(key, "no upstream available, waiting for timer"),
        }
    }

    /// Pending paling sedikit di antara upstream yang punya stream
    /// (yang pertama menang kalau seri). Kalau tidak ada, coba connect
    /// upstream berikutnya secara round-robin.
    fn choose_upstream(&mut self, reactor: &mut Reactor) -> Option<usize> {
        let limit = self.config.max_pending;
        let mut best: Option<(usize, usize)> = None;

        for (idx, up) in self.upstreams.iter().enumerate() {
            let Some(stream) = up.stream.as_ref() else {
                continue;
            };
            if limit.map_or(false, |limit| stream.pending() > limit) {
                continue;
            }
            let load = up.pending.len();
            if best.map_or(true, |(_, min)| load < min) {
                best = Some((idx, load));
            }
        }
        if let Some((idx, _)) = best {
            return Some(idx);
        }

        if self.upstreams.is_empty() {
            return None;
        }
        let idx = self.rr_cursor % self.upstreams.len();
        self.rr_cursor = self.rr_cursor.wrapping_add(1);

        let up = &self.upstreams[idx];
        if up.stream.is_none() && up.link.ready_to_connect(Instant::now()) && self.connect(reactor, idx)
        {
            return Some(idx);
        }
        None
    }

    fn connect(&mut self, reactor: &mut Reactor, idx: usize) -> bool {
        let me = self.me.clone();
        let up = &mut self.upstreams[idx];
        up.epoch += 1;
        up.next_id = 0;

        let now = Instant::now();
        up.link.on_event(LinkEvent::ConnectStarted, now);

        let handler = upstream_handler(me, up.id, up.epoch);
        match Stream::connect_shared(reactor, up.addr, handler) {
            Ok(stream) => {
                if stream.kind() == StreamKind::Normal {
                    up.link.on_event(LinkEvent::ConnectOk, now);
                }
                trace!(addr = %up.addr, epoch = up.epoch, "upstream connecting");
                up.stream = Some(stream);
                true
            }
            Err(e) => {
                let t = up.link.on_event(LinkEvent::ConnectFail, now);
                debug!(addr = %up.addr, error = %e, next_delay = ?t.delay, "upstream connect failed");
                false
            }
        }
    }

    fn send(&mut self, reactor: &mut Reactor, idx: usize, key: RequestKey) -> bool {
        let Some(req) = self.requests.get_mut(&key) else {
            return false;
        };
        let up = &mut self.upstreams[idx];
        let Some(stream) = up.stream.clone() else {
            return false;
        };

        let id = up.next_id;
        up.next_id += 1;
        let frame = encode_frame(id, req.kind, &req.body);

        match stream.write(reactor, &frame) {
            Ok(()) => {
                up.pending.insert(id, key);
                req.bound = Some((up.id, id));
                trace!(key, id, addr = %up.addr, attempt = req.retry_count, "request sent");
                true
            }
            Err(e) => {
                debug!(addr = %up.addr, error = %e, "send failed, resetting upstream");
                self.reset(reactor, idx);
                false
            }
        }
    }

    /// Tutup stream upstream, unbind semua request, catat kegagalan di link
    fn reset(&mut self, reactor: &mut Reactor, idx: usize) {
        let up = &mut self.upstreams[idx];
        let Some(stream) = up.stream.take() else {
            return;
        };
        let was_connected = stream.kind() == StreamKind::Normal;
        stream.close(reactor);
        up.epoch += 1;

        let now = Instant::now();
        if was_connected {
            up.link.on_event(LinkEvent::ConnectOk, now);
        }
        let event = match up.link.state() {
            LinkState::Connected => LinkEvent::Closed,
            _ => LinkEvent::ConnectFail,
        };
        let t = up.link.on_event(event, now);

        let unbound = up.pending.len();
        for (_, key) in up.pending.drain() {
            if let Some(req) = self.requests.get_mut(&key) {
                req.bound = None;
            }
        }
        debug!(addr = %up.addr, unbound, next_delay = ?t.delay, "upstream reset");
    }

    fn arm_check(&mut self, reactor: &mut Reactor) {
        if self.check_timer.is_some() || self.shut_down {
            return;
        }
        let weak = self.me.clone();
        self.check_timer = Some(
            reactor.start_timer(self.config.check_interval, move |reactor| {
                on_check(reactor, &weak)
            }),
        );
    }

    fn upstream_index(&self, upstream_id: u64, epoch: u64) -> Option<usize> {
        self.upstreams
            .iter()
            .position(|u| u.id == upstream_id && u.epoch == epoch)
    }
}

fn upstream_handler(
    me: Weak<RefCell<ClientState>>,
    upstream_id: u64,
    epoch: u64,
) -> StreamHandler {
    Rc::new(move |reactor: &mut Reactor, stream: &Stream, event: StreamEvent| {
        let Some(state) = me.upgrade() else {
            stream.close(reactor);
            return;
        };
        match event {
            StreamEvent::Data => on_upstream_data(reactor, &state, upstream_id, epoch, stream),
            StreamEvent::Error | StreamEvent::Close => {
                let mut state = state.borrow_mut();
                match state.upstream_index(upstream_id, epoch) {
                    Some(idx) => state.reset(reactor, idx),
                    None => stream.close(reactor),
                }
            }
            StreamEvent::Accept(accepted) => accepted.close(reactor),
        }
    })
}

fn on_upstream_data(
    reactor: &mut Reactor,
    state: &Rc<RefCell<ClientState>>,
    upstream_id: u64,
    epoch: u64,
    stream: &Stream,
) {
    let mut completed: Vec<(CallCallback, Vec<u8>)> = Vec::new();
    {
        let mut guard = state.borrow_mut();
        let state = &mut *guard;
        let Some(idx) = state.upstream_index(upstream_id, epoch) else {
            stream.close(reactor);
            return;
        };
        if state.upstreams[idx].link.state() == LinkState::Connecting {
            state.upstreams[idx]
                .link
                .on_event(LinkEvent::ConnectOk, Instant::now());
        }

        let mut frames = Vec::new();
        let parsed = {
            let mut input = stream.input();
            let mut decoder = FrameDecoder::new(input.data());
            let parsed = loop {
                match decoder.next_frame() {
                    Ok(Some((header, body))) => frames.push((header, body.to_vec())),
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            };
            let consumed = decoder.consumed();
            input.erase(consumed);
            parsed
        };

        for (header, body) in frames {
            let Some(key) = state.upstreams[idx].pending.remove(&header.id) else {
                trace!(id = header.id, "response for unknown id dropped");
                continue;
            };

            let kind_matches = state
                .requests
                .get(&key)
                .map_or(false, |req| req.kind == header.kind);
            if !kind_matches {
                // dianggap tidak pernah terkirim; timer yang menentukan
                warn!(id = header.id, kind = header.kind, "response type mismatch");
                if let Some(req) = state.requests.get_mut(&key) {
                    req.bound = None;
                }
                continue;
            }

            if let Some(req) = state.requests.remove(&key) {
                if let Some(timer) = req.timer {
                    reactor.stop_timer(timer);
                }
                trace!(key, id = header.id, len = body.len(), "response received");
                completed.push((req.callback, body));
            }
        }

        if let Err(e) = parsed {
            warn!(addr = %state.upstreams[idx].addr, error = %e, "protocol violation from upstream");
            state.reset(reactor, idx);
        }
    }

    for (callback, body) in completed {
        callback(reactor, Ok(body));
    }
}

fn on_call_timer(reactor: &mut Reactor, weak: &Weak<RefCell<ClientState>>, key: RequestKey) {
    let Some(state) = weak.upgrade() else {
        return;
    };

    let expired = {
        let mut guard = state.borrow_mut();
        let state = &mut *guard;
        let Some(req) = state.requests.get_mut(&key) else {
            return;
        };
        req.timer = None;
        let bound = req.bound.take();
        let exhausted = req.retry_count >= req.retry_times;
        if !exhausted {
            req.retry_count += 1;
        }
        let (timeout, attempt) = (req.timeout, req.retry_count);

        if let Some((upstream_id, wire_id)) = bound {
            if let Some(up) = state.upstreams.iter_mut().find(|u| u.id == upstream_id) {
                up.pending.remove(&wire_id);
            }
        }

        if exhausted {
            state.requests.remove(&key).map(|req| req.callback)
        } else {
            let weak = weak.clone();
            let timer = reactor.start_timer(timeout, move |reactor| {
                on_call_timer(reactor, &weak, key)
            });
            if let Some(req) = state.requests.get_mut(&key) {
                req.timer = Some(timer);
            }
            debug!(key, attempt, "call timed out, retrying");
            state.dispatch(reactor, key);
            None
        }
    };

    if let Some(callback) = expired {
        debug!(key, "call timed out");
        callback(reactor, Err(RpcError::Timeout));
    }
}

/// Pemeriksaan periodik: reconnect sesuai backoff, reset koneksi yang
/// backlog-nya melewati `max_pending`
fn on_check(reactor: &mut Reactor, weak: &Weak<RefCell<ClientState>>) {
    let Some(state) = weak.upgrade() else {
        return;
    };
    let mut guard = state.borrow_mut();
    let state = &mut *guard;
    state.check_timer = None;
    if state.shut_down {
        return;
    }

    let now = Instant::now();
    for idx in 0..state.upstreams.len() {
        let stream = state.upstreams[idx].stream.clone();
        match stream {
            None => {
                if state.upstreams[idx].link.ready_to_connect(now) {
                    state.connect(reactor, idx);
                }
            }
            Some(stream) => {
                let up = &mut state.upstreams[idx];
                if stream.kind() == StreamKind::Normal && up.link.state() == LinkState::Connecting {
                    up.link.on_event(LinkEvent::ConnectOk, now);
                }
                let backlog = stream.pending();
                if state.config.max_pending.map_or(false, |limit| backlog > limit) {
                    warn!(addr = %state.upstreams[idx].addr, backlog, "outbound backlog over limit, resetting");
                    state.reset(reactor, idx);
                }
            }
        }
    }

    state.arm_check(reactor);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::net::TcpListener as StdListener;

    /// Alamat yang pasti menolak koneksi: port bekas listener yang sudah ditutup
    fn refused_addr() -> SocketAddr {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn run_until(reactor: &mut Reactor, limit: Duration, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + limit;
        while !done() && Instant::now() < deadline {
            reactor.run(Duration::from_millis(5)).unwrap();
        }
    }

    #[test]
    fn test_no_upstream_times_out_after_all_retries() {
        let mut reactor = Reactor::new().unwrap();
        let client = RpcClient::new(ClientConfig::default());
        let result: Rc<RefCell<Option<(bool, Instant)>>> = Rc::new(RefCell::new(None));

        let start = Instant::now();
        let slot = Rc::clone(&result);
        client.call(
            &mut reactor,
            CallOptions::new(0, Duration::from_millis(30), 2),
            b"ping",
            move |_, res| {
                *slot.borrow_mut() = Some((res.map_or_else(|e| e.is_timeout(), |_| false), Instant::now()));
            },
        );
        assert_eq!(client.outstanding_calls(), 1);

        run_until(&mut reactor, Duration::from_secs(2), || result.borrow().is_some());

        let (timed_out, at) = result.borrow().unwrap();
        assert!(timed_out);
        let elapsed = at - start;
        assert!(elapsed >= Duration::from_millis(90));
        assert!(elapsed < Duration::from_millis(400));
        assert_eq!(client.outstanding_calls(), 0);
    }

    #[test]
    fn test_unbounded_timeout_waits_until_shutdown() {
        let mut reactor = Reactor::new().unwrap();
        let client = RpcClient::new(ClientConfig::default());
        let fired = Rc::new(Cell::new(false));

        let flag = Rc::clone(&fired);
        client.call(
            &mut reactor,
            CallOptions::new(0, Duration::MAX, u32::MAX),
            b"x",
            move |_, res| {
                assert!(matches!(res, Err(RpcError::Shutdown)));
                flag.set(true);
            },
        );
        reactor.run(Duration::ZERO).unwrap();
        assert!(!fired.get());
        assert_eq!(client.outstanding_calls(), 1);

        client.shutdown(&mut reactor);
        assert!(fired.get());
    }

    #[test]
    fn test_duplicate_upstream_ignored() {
        let mut reactor = Reactor::new().unwrap();
        let client = RpcClient::new(ClientConfig::default());
        let addr = refused_addr();

        assert!(client.add_upstream(&mut reactor, addr));
        assert!(!client.add_upstream(&mut reactor, addr));
        assert_eq!(client.upstream_count(), 1);

        assert!(client.remove_upstream(&mut reactor, addr));
        assert!(!client.remove_upstream(&mut reactor, addr));
        assert_eq!(client.upstream_count(), 0);
    }

    #[test]
    fn test_refused_upstream_backs_off() {
        let mut reactor = Reactor::new().unwrap();
        let client = RpcClient::new(ClientConfig::default());
        let addr = refused_addr();
        client.add_upstream(&mut reactor, addr);

        run_until(&mut reactor, Duration::from_secs(1), || {
            client.link_state(addr) == Some(LinkState::Disconnected)
        });

        assert_eq!(client.link_state(addr), Some(LinkState::Disconnected));
        // gagal cepat -> delay berikutnya sudah digandakan
        assert_eq!(client.reconnect_delay(addr), Some(Duration::from_secs(2)));
        assert_eq!(client.connected_upstreams(), 0);
    }

    #[test]
    fn test_shutdown_completes_every_call_once() {
        let mut reactor = Reactor::new().unwrap();
        let client = RpcClient::new(ClientConfig::default());
        client.add_upstream(&mut reactor, refused_addr());

        let fired = Rc::new(Cell::new(0));
        for _ in 0..5 {
            let fired = Rc::clone(&fired);
            client.call(
                &mut reactor,
                CallOptions::new(1, Duration::from_secs(10), 0),
                b"x",
                move |_, res| {
                    assert!(matches!(res, Err(RpcError::Shutdown)));
                    fired.set(fired.get() + 1);
                },
            );
        }

        client.shutdown(&mut reactor);
        assert_eq!(fired.get(), 5);
        assert_eq!(reactor.timer_count(), 0);

        // shutdown kedua dan call setelah shutdown
        client.shutdown(&mut reactor);
        let late = Rc::clone(&fired);
        client.call(&mut reactor, CallOptions::default(), b"", move |_, res| {
            assert!(res.unwrap_err().is_timeout());
            late.set(late.get() + 1);
        });
        assert_eq!(fired.get(), 6);
    }
}
