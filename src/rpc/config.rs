//! Konfigurasi RPC client dan per-call options

use std::time::Duration;

use super::backoff::ReconnectPolicy;

/// Konfigurasi RPC client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Interval pemeriksaan upstream (reconnect, batas backlog)
    pub check_interval: Duration,

    /// Backoff reconnect per upstream
    pub reconnect: ReconnectPolicy,

    /// Batas byte outbound yang boleh antri di satu koneksi.
    ///
    /// Upstream yang melewati batas tidak dipilih untuk call baru dan
    /// koneksinya di-reset pada pemeriksaan berikutnya.
    /// `None` berarti tidak dibatasi.
    pub max_pending: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(20),
            reconnect: ReconnectPolicy::default(),
            max_pending: None,
        }
    }
}

impl ClientConfig {
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_max_pending(mut self, bytes: usize) -> Self {
        self.max_pending = Some(bytes);
        self
    }
}

/// Parameter satu RPC call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Tipe request di header, juga dipakai untuk mencocokkan response
    pub request_type: u32,
    /// Deadline per percobaan
    pub timeout: Duration,
    /// Jumlah kirim ulang maksimal setelah percobaan pertama
    pub retry_times: u32,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            request_type: 0,
            timeout: Duration::from_millis(1000),
            retry_times: 0,
        }
    }
}

impl CallOptions {
    pub fn new(request_type: u32, timeout: Duration, retry_times: u32) -> Self {
        Self {
            request_type,
            timeout,
            retry_times,
        }
    }

    /// Batas atas waktu sampai callback pasti dipanggil
    pub fn deadline(&self) -> Duration {
        self.timeout
            .checked_mul(self.retry_times.saturating_add(1))
            .unwrap_or(Duration::MAX)
    }
}
