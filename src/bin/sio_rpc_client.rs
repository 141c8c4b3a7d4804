//! sio RPC Client Binary
//!
//! Kirim sejumlah call ke satu atau lebih upstream lalu cetak
//! ringkasan latency dan jumlah timeout.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin sio_rpc_client -- --upstream 127.0.0.1:9999 --count 1000
//! ```

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{debug, info, warn};

use sio::network::Reactor;
use sio::rpc::{CallOptions, ClientConfig, RpcClient};

#[derive(Parser, Debug)]
#[command(name = "sio_rpc_client", about = "RPC load generator for sio_rpc_server")]
struct Cli {
    /// Alamat upstream, boleh diulang
    #[arg(long = "upstream", short = 'u', required = true)]
    upstreams: Vec<SocketAddr>,

    /// Jumlah call
    #[arg(long, short = 'n', default_value_t = 1000)]
    count: usize,

    /// Call yang boleh berjalan bersamaan
    #[arg(long, default_value_t = 64)]
    concurrency: usize,

    /// Timeout per percobaan (ms)
    #[arg(long, default_value_t = 100)]
    timeout_ms: u64,

    /// Jumlah retry setelah percobaan pertama
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Request type (0 = ping, 1 = echo)
    #[arg(long = "type", default_value_t = 0)]
    request_type: u32,

    /// Body request
    #[arg(long, default_value = "ping")]
    body: String,
}

/// Hasil call, dikumpulkan di thread reactor
#[derive(Default)]
struct RunStats {
    issued: usize,
    ok: usize,
    timeouts: usize,
    latencies_ns: Vec<u64>,
}

impl RunStats {
    fn completed(&self) -> usize {
        self.ok + self.timeouts
    }

    fn percentile(sorted: &[u64], p: f64) -> u64 {
        if sorted.is_empty() {
            return 0;
        }
        let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    fn print_summary(&mut self, elapsed: Duration) {
        self.latencies_ns.sort_unstable();
        let lat = &self.latencies_ns;
        let avg = if lat.is_empty() {
            0
        } else {
            lat.iter().sum::<u64>() / lat.len() as u64
        };

        info!(
            calls = self.issued,
            ok = self.ok,
            timeouts = self.timeouts,
            elapsed_ms = elapsed.as_millis() as u64,
            rate_per_sec = %format!("{:.1}", self.completed() as f64 / elapsed.as_secs_f64()),
            "run complete"
        );
        info!(
            avg_us = avg / 1000,
            p50_us = Self::percentile(lat, 0.50) / 1000,
            p99_us = Self::percentile(lat, 0.99) / 1000,
            max_us = lat.last().copied().unwrap_or(0) / 1000,
            "latency"
        );
    }
}

fn issue_next(reactor: &mut Reactor, client: &RpcClient, stats: &Rc<RefCell<RunStats>>, cli: &Rc<Cli>) {
    {
        let mut s = stats.borrow_mut();
        if s.issued >= cli.count {
            return;
        }
        s.issued += 1;
    }

    let options = CallOptions::new(
        cli.request_type,
        Duration::from_millis(cli.timeout_ms),
        cli.retries,
    );
    let sent_at = Instant::now();
    let next_client = client.clone();
    let next_stats = Rc::clone(stats);
    let next_cli = Rc::clone(cli);

    client.call(reactor, options, cli.body.as_bytes(), move |reactor, result| {
        {
            let mut s = next_stats.borrow_mut();
            match result {
                Ok(body) => {
                    s.ok += 1;
                    s.latencies_ns.push(sent_at.elapsed().as_nanos() as u64);
                    debug!(len = body.len(), "response");
                }
                Err(e) => {
                    s.timeouts += 1;
                    debug!(error = %e, "call failed");
                }
            }
        }
        issue_next(reactor, &next_client, &next_stats, &next_cli);
    });
}

fn run_client(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut reactor = Reactor::new()?;
    let client = RpcClient::new(ClientConfig::default());
    for addr in &cli.upstreams {
        client.add_upstream(&mut reactor, *addr);
    }
    info!(upstreams = client.upstream_count(), count = cli.count, "starting");

    let cli = Rc::new(cli);
    let stats = Rc::new(RefCell::new(RunStats::default()));
    let start = Instant::now();

    for _ in 0..cli.concurrency.max(1) {
        issue_next(&mut reactor, &client, &stats, &cli);
    }

    while stats.borrow().completed() < cli.count {
        reactor.run(Duration::from_millis(100))?;
    }

    let elapsed = start.elapsed();
    client.shutdown(&mut reactor);

    let mut stats = stats.borrow_mut();
    if stats.timeouts > 0 {
        warn!(timeouts = stats.timeouts, "some calls timed out");
    }
    stats.print_summary(elapsed);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Err(e) = run_client(cli) {
        eprintln!("Client error: {}", e);
        std::process::exit(1);
    }
}
