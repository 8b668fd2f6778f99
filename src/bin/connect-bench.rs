//! Connect-latency load generator.
//!
//! Opens many concurrent clients against a liveness server and measures,
//! per client, the time from a completed connect to the first
//! acknowledgement byte after sending one byte. Any greeting the server
//! sends first is skipped.
//!
//! Usage:
//!     connect-bench --target 127.0.0.1:6161 --clients 1000

use clap::Parser;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const ACK: u8 = 0x01;

#[derive(Parser, Debug)]
#[command(name = "connect-bench")]
#[command(about = "Measure connect-to-ack latency of a liveness server", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:6161")]
    target: SocketAddr,

    /// Number of concurrent clients
    #[arg(short, long, default_value_t = 1000)]
    clients: usize,

    /// Per-client deadline in milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
}

async fn time_to_ack(target: SocketAddr) -> std::io::Result<Duration> {
    let mut client = TcpStream::connect(target).await?;
    let start = Instant::now();
    client.write_all(&[0]).await?;

    let mut buf = [0u8; 256];
    loop {
        let n = client.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        if buf[..n].contains(&ACK) {
            return Ok(start.elapsed());
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let deadline = Duration::from_millis(args.timeout_ms);

    let mut handles = Vec::with_capacity(args.clients);
    for _ in 0..args.clients {
        let target = args.target;
        handles.push(tokio::spawn(async move {
            tokio::time::timeout(deadline, time_to_ack(target)).await
        }));
    }

    let mut times = Vec::with_capacity(args.clients);
    let mut failed = 0usize;
    for handle in handles {
        match handle.await {
            Ok(Ok(Ok(elapsed))) => times.push(elapsed),
            _ => failed += 1,
        }
    }

    println!("Server: {}", args.target);
    if times.is_empty() {
        println!("No client received an acknowledgement");
    } else {
        times.sort_unstable();
        let total: Duration = times.iter().sum();
        println!("Min time to ack  {:?}", times[0]);
        println!("Max time to ack  {:?}", times[times.len() - 1]);
        println!("Mean time to ack {:?}", total / times.len() as u32);
    }
    println!("{failed} clients could not connect");
}
