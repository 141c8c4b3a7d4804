//! sio RPC Server Binary
//!
//! Method bawaan:
//! - type 0: ping, dijawab "pong"
//! - type 1: echo, body dikembalikan apa adanya
//!
//! Usage:
//!   cargo run --release --bin sio_rpc_server -- --bind 127.0.0.1:9999

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use sio::network::Reactor;
use sio::rpc::RpcServer;

const PING: u32 = 0;
const ECHO: u32 = 1;

/// Interval cetak statistik
const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "sio_rpc_server", about = "Single-threaded RPC server (ping + echo)")]
struct Cli {
    /// Alamat listen
    #[arg(long, short = 'b', default_value = "127.0.0.1:9999")]
    bind: SocketAddr,

    /// Log per request
    #[arg(long, short = 'v', default_value_t = false)]
    verbose: bool,
}

/// Statistik server, hanya disentuh dari thread reactor
#[derive(Default)]
struct ServerStats {
    requests: Cell<u64>,
    bytes_in: Cell<u64>,
    bytes_out: Cell<u64>,
}

impl ServerStats {
    fn record(&self, body_in: usize, body_out: usize) {
        self.requests.set(self.requests.get() + 1);
        self.bytes_in.set(self.bytes_in.get() + body_in as u64);
        self.bytes_out.set(self.bytes_out.get() + body_out as u64);
    }

    fn print_stats(&self, uptime: Duration, connections: usize) {
        let requests = self.requests.get();
        let rate = requests as f64 / uptime.as_secs_f64();
        info!(
            uptime_secs = %format!("{:.1}", uptime.as_secs_f64()),
            requests,
            rate_per_sec = %format!("{:.1}", rate),
            bytes_in = self.bytes_in.get(),
            bytes_out = self.bytes_out.get(),
            connections,
            "server stats"
        );
    }
}

fn schedule_stats(reactor: &mut Reactor, server: RpcServer, stats: Rc<ServerStats>, start: Instant) {
    reactor.start_timer(STATS_INTERVAL, move |reactor| {
        stats.print_stats(start.elapsed(), server.connection_count());
        schedule_stats(reactor, server, stats, start);
    });
}

fn run_server(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut reactor = Reactor::new()?;
    let server = RpcServer::add_service(&mut reactor, cli.bind)?;
    let stats = Rc::new(ServerStats::default());
    let verbose = cli.verbose;

    let ping_stats = Rc::clone(&stats);
    server.register_protocol(PING, move |reactor, request| {
        if verbose {
            info!(id = request.id(), conn = request.connection_id(), "ping");
        }
        ping_stats.record(request.body().len(), 4);
        request.finish(reactor, b"pong");
    })?;

    let echo_stats = Rc::clone(&stats);
    server.register_protocol(ECHO, move |reactor, request| {
        if verbose {
            info!(id = request.id(), len = request.body().len(), "echo");
        }
        let body = request.body().to_vec();
        echo_stats.record(body.len(), body.len());
        request.finish(reactor, &body);
    })?;

    info!(addr = ?server.local_addr(), "rpc server listening");
    schedule_stats(&mut reactor, server.clone(), stats, Instant::now());

    loop {
        reactor.run(Duration::from_millis(100))?;
    }
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    if let Err(e) = run_server(cli) {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}
