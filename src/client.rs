//! Round-trip benchmark client.
//!
//! Opens one connection, asks the server to identify itself, then runs a
//! fixed number of sequential TEST exchanges. Each exchange is:
//!
//! ```text
//! client -> TEST frame with n random filler bytes
//! server -> "TEST received with data size n"
//! server -> TEST frame with k random filler bytes
//! client -> "TEST received with data size k"
//! ```
//!
//! Only one request is ever outstanding, so the measured time is round-trip
//! latency rather than throughput.

use crate::config::{Config, PayloadRange};
use crate::protocol::{read_frame, test_ack, write_frame, Command, Frame, FrameError, CMD_WHO};
use crate::trace::{Action, TraceSink};
use bytes::Bytes;
use chrono::{DateTime, Local};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Benchmark errors. Any of these aborts the run.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server closed the connection mid-run")]
    ServerClosed,

    #[error("unexpected frame: expected {expected}, got command {got:?}")]
    UnexpectedFrame { expected: &'static str, got: String },
}

/// Running statistics over measured messages
#[derive(Debug, Clone)]
pub struct RunStats {
    messages: u64,
    total_bytes: u64,
    min_size: usize,
    max_size: usize,
    elapsed: Duration,
    fastest_exchange: Option<Duration>,
    slowest_exchange: Option<Duration>,
    started_at: DateTime<Local>,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            messages: 0,
            total_bytes: 0,
            min_size: usize::MAX,
            max_size: 0,
            elapsed: Duration::ZERO,
            fastest_exchange: None,
            slowest_exchange: None,
            started_at: Local::now(),
        }
    }

    /// Record one measured message of `size` payload bytes.
    pub fn record_message(&mut self, size: usize) {
        self.messages += 1;
        self.total_bytes += size as u64;
        self.min_size = self.min_size.min(size);
        self.max_size = self.max_size.max(size);
    }

    /// Record the wall time of one full exchange.
    pub fn record_exchange(&mut self, elapsed: Duration) {
        self.elapsed += elapsed;
        self.fastest_exchange = Some(self.fastest_exchange.map_or(elapsed, |d| d.min(elapsed)));
        self.slowest_exchange = Some(self.slowest_exchange.map_or(elapsed, |d| d.max(elapsed)));
    }

    /// Close the run and compute averages.
    pub fn finish(self, server_identity: String) -> Summary {
        let (avg_size, avg_time) = if self.messages == 0 {
            (0.0, Duration::ZERO)
        } else {
            (
                self.total_bytes as f64 / self.messages as f64,
                self.elapsed / self.messages as u32,
            )
        };

        Summary {
            server_identity,
            messages: self.messages,
            total_bytes: self.total_bytes,
            total_time: self.elapsed,
            avg_size,
            avg_time,
            min_size: if self.messages == 0 { 0 } else { self.min_size },
            max_size: self.max_size,
            fastest_exchange: self.fastest_exchange.unwrap_or_default(),
            slowest_exchange: self.slowest_exchange.unwrap_or_default(),
            started_at: self.started_at,
            finished_at: Local::now(),
        }
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct Summary {
    pub server_identity: String,
    pub messages: u64,
    pub total_bytes: u64,
    pub total_time: Duration,
    pub avg_size: f64,
    pub avg_time: Duration,
    pub min_size: usize,
    pub max_size: usize,
    pub fastest_exchange: Duration,
    pub slowest_exchange: Duration,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
}

impl Summary {
    /// Report lines, in the order they are traced.
    pub fn lines(&self) -> Vec<String> {
        vec![
            format!("Server: {}", self.server_identity),
            format!("Total messages: {}", self.messages),
            format!("Total bytes: {}", self.total_bytes),
            format!("Total time: {:.6} seconds", self.total_time.as_secs_f64()),
            format!("Average message size: {:.2} bytes", self.avg_size),
            format!(
                "Average time per message: {:.6} seconds",
                self.avg_time.as_secs_f64()
            ),
            format!("Min message size: {} bytes", self.min_size),
            format!("Max message size: {} bytes", self.max_size),
            format!(
                "Fastest exchange: {:.6} seconds",
                self.fastest_exchange.as_secs_f64()
            ),
            format!(
                "Slowest exchange: {:.6} seconds",
                self.slowest_exchange.as_secs_f64()
            ),
            format!(
                "Run window: {} .. {}",
                self.started_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                self.finished_at.format("%Y-%m-%d %H:%M:%S%.3f")
            ),
        ]
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.lines() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

/// Benchmark driver
pub struct Bench {
    exchanges: usize,
    payload: PayloadRange,
    sink: Arc<TraceSink>,
    rng: StdRng,
}

impl Bench {
    pub fn new(config: &Config, sink: Arc<TraceSink>) -> Self {
        Self {
            exchanges: config.exchanges,
            payload: config.payload,
            sink,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a fixed seed for payload sizes.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Connect to `addr` and run the benchmark over that one connection.
    pub async fn connect_and_run(&mut self, addr: &str) -> Result<Summary, BenchError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!(server = %addr, "Connected");
        self.run(stream).await
    }

    /// Run the benchmark over an established stream.
    pub async fn run<S>(&mut self, stream: S) -> Result<Summary, BenchError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufStream::new(stream);

        write_frame(&mut stream, &Frame::new(CMD_WHO, Bytes::new())).await?;
        self.sink.record(Action::Sent, CMD_WHO);
        let identity = expect_frame(&mut stream).await?.payload_text();
        self.sink.record(Action::Received, &identity);

        let mut stats = RunStats::new();
        for exchange in 0..self.exchanges {
            self.exchange(&mut stream, &mut stats).await?;
            debug!(exchange, "Exchange complete");
        }

        let summary = stats.finish(identity);
        for line in summary.lines() {
            self.sink.record(Action::Result, line);
        }
        Ok(summary)
    }

    async fn exchange<S>(
        &mut self,
        stream: &mut BufStream<S>,
        stats: &mut RunStats,
    ) -> Result<(), BenchError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let size = self.payload.sample(&mut self.rng);
        let request = Frame::filler(size);

        let start = Instant::now();
        write_frame(stream, &request).await?;
        self.sink
            .record(Action::Sent, format!("TEST with data size {size}"));
        stats.record_message(size);

        let ack = expect_frame(stream).await?;
        self.sink.record(Action::Received, ack.payload_text());

        let push = expect_frame(stream).await?;
        if push.kind() != Command::Test {
            return Err(BenchError::UnexpectedFrame {
                expected: "TEST",
                got: push.command,
            });
        }
        let received = push.payload.len();
        self.sink.record(
            Action::Received,
            format!("{} with data size {received}", push.command),
        );
        stats.record_message(received);

        let reply = test_ack(received);
        write_frame(stream, &Frame::text(reply.as_str())).await?;
        self.sink.record(Action::Sent, reply);

        stats.record_exchange(start.elapsed());
        Ok(())
    }
}

/// Read a frame the protocol requires; a close here aborts the run.
async fn expect_frame<R>(reader: &mut R) -> Result<Frame, BenchError>
where
    R: AsyncRead + Unpin,
{
    read_frame(reader).await?.ok_or(BenchError::ServerClosed)
}
