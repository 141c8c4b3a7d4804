//! sio - micro-benchmark untuk struktur data inti
//!
//! Mengukur:
//! - Buffer append/erase (pola pemakaian inbound/outbound stream)
//! - Timer heap insert/pop dan cancel
//! - Encode/decode header RPC

use std::time::{Duration, Instant};

use sio::core::{Buffer, TimerHeap};
use sio::protocol::{encode_frame, FrameDecoder, RpcHeader, HEADER_SIZE};

fn main() {
    println!("sio reactor core - micro benchmarks");
    println!("===================================\n");

    benchmark_buffer();
    benchmark_timer_heap();
    benchmark_protocol();

    println!("\nAll benchmarks complete.");
    println!("To start a server: cargo run --release --bin sio_rpc_server -- --bind 127.0.0.1:9999");
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let ns = elapsed.as_nanos() as f64 / ops as f64;
    println!("  {:<18} {:.2} ns/op ({:.3} μs/op)", label, ns, ns / 1000.0);
}

fn benchmark_buffer() {
    println!("Buffer (append + erase)");
    println!("-----------------------");

    const ITERATIONS: usize = 1_000_000;
    const CHUNK: usize = 64;

    let mut buffer = Buffer::new();
    let chunk = [0xABu8; CHUNK];

    // Warm up
    for _ in 0..1000 {
        buffer.append(&chunk);
    }
    buffer.clear();

    // Producer sedikit lebih cepat dari consumer, memaksa compaction
    let start = Instant::now();
    for i in 0..ITERATIONS {
        buffer.append(&chunk);
        if i % 4 != 3 {
            buffer.erase(CHUNK);
        }
    }
    let elapsed = start.elapsed();

    println!("  Operations: {}", ITERATIONS);
    report("Append+erase:", ITERATIONS, elapsed);
    println!(
        "  Throughput:        {:.2} MB/sec",
        (ITERATIONS * CHUNK) as f64 / elapsed.as_secs_f64() / 1_000_000.0
    );
    println!("  Final len/capacity: {} / {}\n", buffer.len(), buffer.capacity());
}

fn benchmark_timer_heap() {
    println!("Timer Heap (insert + pop)");
    println!("-------------------------");

    const ITERATIONS: usize = 100_000;

    let mut heap: TimerHeap<usize> = TimerHeap::new();
    let base = Instant::now();

    // Expiry acak-semu supaya sift benar-benar bekerja
    let start = Instant::now();
    let mut keys = Vec::with_capacity(ITERATIONS);
    for i in 0..ITERATIONS {
        let offset = (i.wrapping_mul(2_654_435_761) % 10_000) as u64;
        keys.push(heap.insert(base + Duration::from_micros(offset), i));
    }
    let insert_elapsed = start.elapsed();

    // Cancel setengah
    let start = Instant::now();
    for key in keys.iter().step_by(2) {
        heap.remove(*key);
    }
    let cancel_elapsed = start.elapsed();

    let start = Instant::now();
    let mut popped = 0;
    while heap.pop().is_some() {
        popped += 1;
    }
    let pop_elapsed = start.elapsed();

    println!("  Timers: {}", ITERATIONS);
    report("Insert:", ITERATIONS, insert_elapsed);
    report("Cancel:", ITERATIONS / 2, cancel_elapsed);
    report("Pop:", popped.max(1), pop_elapsed);
    println!();
}

fn benchmark_protocol() {
    println!("Protocol (24-byte header)");
    println!("-------------------------");

    const ITERATIONS: usize = 1_000_000;
    const BODY_SIZE: usize = 64;

    let mut out = [0u8; HEADER_SIZE];
    let start = Instant::now();
    for i in 0..ITERATIONS {
        let header = RpcHeader::new(i as u64, 1, BODY_SIZE as u32);
        let _ = header.encode(&mut out);
        std::hint::black_box(&out);
    }
    let encode_elapsed = start.elapsed();

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        let _ = std::hint::black_box(RpcHeader::decode(&out));
    }
    let decode_elapsed = start.elapsed();

    // Stream berisi 10000 frame berurutan
    let body = vec![0u8; BODY_SIZE];
    let mut stream = Vec::new();
    for i in 0..10_000u64 {
        stream.extend_from_slice(&encode_frame(i, 1, &body));
    }
    let start = Instant::now();
    let mut frames = 0usize;
    for _ in 0..100 {
        let mut decoder = FrameDecoder::new(&stream);
        while let Ok(Some(_)) = decoder.next_frame() {
            frames += 1;
        }
    }
    let frame_elapsed = start.elapsed();

    println!("  Body size: {} bytes", BODY_SIZE);
    report("Header encode:", ITERATIONS, encode_elapsed);
    report("Header decode:", ITERATIONS, decode_elapsed);
    report("Frame decode:", frames.max(1), frame_elapsed);
    println!(
        "  Frame throughput:  {:.2} M frames/sec",
        frames as f64 / frame_elapsed.as_secs_f64() / 1_000_000.0
    );
}
