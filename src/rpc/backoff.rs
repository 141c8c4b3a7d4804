//! Reconnect backoff per upstream
//!
//! Satu state machine eksplisit menggantikan mutasi delay yang tersebar:
//!
//! ```text
//! Disconnected --ConnectStarted--> Connecting --ConnectOk--> Connected
//!      ^                               |                         |
//!      +--------- ConnectFail ---------+--------- Closed --------+
//! ```
//!
//! Aturan delay saat gagal (ConnectFail / Closed):
//! - umur koneksi >= `stable_after` -> delay di-reset ke `initial_delay`
//! - reconnect berikutnya boleh setelah `delay`
//! - umur koneksi < `stable_after` -> delay untuk kegagalan berikutnya
//!   digandakan, maksimal `max_delay`
//!
//! Semua transisi menerima `now` dari pemanggil, jadi bisa dites dengan
//! waktu sintetis.

use std::time::{Duration, Instant};

use crate::network::expiry_after;

/// Parameter backoff reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay awal dan batas bawah
    pub initial_delay: Duration,
    /// Batas atas delay
    pub max_delay: Duration,
    /// Koneksi yang hidup selama ini dianggap stabil
    pub stable_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(256),
            stable_after: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, stable_after: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            stable_after,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectStarted,
    ConnectOk,
    ConnectFail,
    Closed,
}

/// Hasil satu transisi
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: LinkState,
    /// Delay yang akan dipakai pada kegagalan berikutnya
    pub delay: Duration,
    /// Kapan reconnect berikutnya diizinkan
    pub retry_at: Option<Instant>,
}

/// State koneksi satu upstream
#[derive(Debug, Clone)]
pub struct Link {
    policy: ReconnectPolicy,
    state: LinkState,
    delay: Duration,
    last_connect: Option<Instant>,
    retry_at: Option<Instant>,
}

impl Link {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: LinkState::Disconnected,
            delay: policy.initial_delay,
            last_connect: None,
            retry_at: None,
        }
    }

    #[inline(always)]
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Delay yang akan dipakai pada kegagalan berikutnya
    #[inline(always)]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    #[inline(always)]
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Disconnected dan window backoff sudah lewat
    pub fn ready_to_connect(&self, now: Instant) -> bool {
        self.state == LinkState::Disconnected && self.retry_at.map_or(true, |at| now >= at)
    }

    /// Terapkan event. Event yang tidak cocok dengan state diabaikan.
    pub fn on_event(&mut self, event: LinkEvent, now: Instant) -> Transition {
        match (self.state, event) {
            (LinkState::Disconnected, LinkEvent::ConnectStarted) => {
                self.state = LinkState::Connecting;
                self.last_connect = Some(now);
                self.retry_at = None;
            }
            (LinkState::Connecting, LinkEvent::ConnectOk) => {
                self.state = LinkState::Connected;
            }
            (LinkState::Connecting, LinkEvent::ConnectFail)
            | (LinkState::Connecting | LinkState::Connected, LinkEvent::Closed) => {
                self.fail(now);
            }
            _ => {}
        }
        self.transition()
    }

    fn fail(&mut self, now: Instant) {
        let lifetime = self
            .last_connect
            .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));

        if lifetime >= self.policy.stable_after {
            self.delay = self.policy.initial_delay;
        }
        self.retry_at = Some(expiry_after(now, self.delay));
        if lifetime < self.policy.stable_after {
            self.delay = self.delay.saturating_mul(2).min(self.policy.max_delay);
        }
        self.state = LinkState::Disconnected;
    }

    fn transition(&self) -> Transition {
        Transition {
            state: self.state,
            delay: self.delay,
            retry_at: self.retry_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_fresh_link_connects_immediately() {
        let link = Link::new(ReconnectPolicy::default());
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(link.ready_to_connect(Instant::now()));
    }

    #[test]
    fn test_transition_table() {
        let t0 = Instant::now();
        let mut link = Link::new(ReconnectPolicy::default());

        // event yang tidak cocok diabaikan
        assert_eq!(link.on_event(LinkEvent::ConnectOk, t0).state, LinkState::Disconnected);
        assert_eq!(link.on_event(LinkEvent::Closed, t0).state, LinkState::Disconnected);

        assert_eq!(link.on_event(LinkEvent::ConnectStarted, t0).state, LinkState::Connecting);
        assert!(!link.ready_to_connect(t0));
        assert_eq!(link.on_event(LinkEvent::ConnectOk, t0).state, LinkState::Connected);

        let t = link.on_event(LinkEvent::Closed, t0 + secs(1));
        assert_eq!(t.state, LinkState::Disconnected);
        assert_eq!(t.retry_at, Some(t0 + secs(2)));
        assert!(!link.ready_to_connect(t0 + secs(1)));
        assert!(link.ready_to_connect(t0 + secs(2)));
    }

    #[test]
    fn test_fast_failures_double_up_to_cap() {
        let policy = ReconnectPolicy::default();
        let mut link = Link::new(policy);
        let mut now = Instant::now();
        let mut waits = Vec::new();

        for _ in 0..15 {
            link.on_event(LinkEvent::ConnectStarted, now);
            link.on_event(LinkEvent::ConnectOk, now);
            // peer langsung menutup koneksi
            let t = link.on_event(LinkEvent::Closed, now);
            let wait = t.retry_at.unwrap() - now;
            assert!(wait >= policy.initial_delay && wait <= policy.max_delay);
            assert!(t.delay >= policy.initial_delay && t.delay <= policy.max_delay);
            waits.push(wait.as_secs());
            now += wait;
        }

        assert_eq!(&waits[..10], &[1, 2, 4, 8, 16, 32, 64, 128, 256, 256]);
        assert!(waits.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_stable_connection_resets_delay() {
        let mut link = Link::new(ReconnectPolicy::default());
        let mut now = Instant::now();

        for _ in 0..4 {
            link.on_event(LinkEvent::ConnectStarted, now);
            link.on_event(LinkEvent::ConnectFail, now);
            now = link.retry_at().unwrap();
        }
        assert_eq!(link.delay(), secs(16));

        link.on_event(LinkEvent::ConnectStarted, now);
        link.on_event(LinkEvent::ConnectOk, now);
        let t = link.on_event(LinkEvent::Closed, now + secs(5));
        assert_eq!(t.retry_at, Some(now + secs(6)));
        assert_eq!(t.delay, secs(1));
    }

    #[test]
    fn test_huge_delay_saturates() {
        let policy = ReconnectPolicy::new(Duration::from_secs(u64::MAX / 2 + 1), Duration::MAX, secs(5));
        let mut link = Link::new(policy);
        let now = Instant::now();

        link.on_event(LinkEvent::ConnectStarted, now);
        let t = link.on_event(LinkEvent::ConnectFail, now);
        assert_eq!(t.state, LinkState::Disconnected);
        assert!(t.retry_at.unwrap() > now);
        assert_eq!(t.delay, Duration::MAX);
        assert!(!link.ready_to_connect(now + secs(3600)));

        // gagal lagi: delay tetap di batas atas
        link.on_event(LinkEvent::ConnectStarted, now);
        let t = link.on_event(LinkEvent::ConnectFail, now);
        assert_eq!(t.delay, Duration::MAX);
        assert!(t.retry_at.unwrap() > now);
    }

    #[test]
    fn test_custom_policy_clamps_max() {
        let policy = ReconnectPolicy::new(
            Duration::from_millis(50),
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        assert_eq!(policy.max_delay, Duration::from_millis(50));

        let mut link = Link::new(policy);
        let now = Instant::now();
        link.on_event(LinkEvent::ConnectStarted, now);
        let t = link.on_event(LinkEvent::ConnectFail, now);
        assert_eq!(t.delay, Duration::from_millis(50));
    }
}
