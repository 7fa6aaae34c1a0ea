//! TCP server for the frame protocol.
//!
//! The listener accepts connections and spawns one task per connection.
//! Each task runs a `Session`: read a frame, dispatch on its command,
//! respond, repeat until the peer closes or the stream breaks.

use crate::config::{Config, PayloadRange};
use crate::protocol::{read_frame, test_ack, write_frame, Command, Frame, FrameError};
use crate::trace::{Action, TraceSink};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Response payload for commands outside the dispatch table
pub const UNRECOGNIZED_RESPONSE: &str = "ERROR: Unrecognized command";

/// State shared by every connection task
#[derive(Clone)]
struct HandlerContext {
    identity: Arc<str>,
    payload: PayloadRange,
    sink: Arc<TraceSink>,
}

/// Server instance. Sole owner of the bound socket.
pub struct Server {
    listener: TcpListener,
    context: HandlerContext,
}

impl Server {
    /// Bind the configured endpoint with the configured backlog.
    pub async fn bind(config: &Config, sink: Arc<TraceSink>) -> io::Result<Self> {
        let addr = tokio::net::lookup_host(&config.listen)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("could not resolve {}", config.listen),
                )
            })?;

        let listener = TcpListener::from_std(create_listener(addr, config.backlog)?)?;

        Ok(Server {
            listener,
            context: HandlerContext {
                identity: Arc::from(config.identity.as_str()),
                payload: config.payload,
                sink,
            },
        })
    }

    /// Address actually bound (useful when binding port 0)
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the process exits.
    pub async fn run(self) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` completes, then close the
    /// listening socket and flush the trace sink. Sessions already running
    /// keep going until their peers close.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!(address = %addr, "Server listening");
        self.context.sink.record(Action::Info, "Server started");

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, closing listener");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "New connection");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        self.context
                            .sink
                            .record(Action::Info, format!("Accepted connection from {peer}"));

                        let session = Session::new(stream, peer, self.context.clone());
                        tokio::spawn(session.run());
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }

        self.context.sink.record(Action::Info, "Server stopped");
        self.context.sink.close();
        Ok(())
    }
}

/// Create a TCP listener with SO_REUSEADDR and an explicit backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// One accepted connection.
///
/// The session is created when the connection is accepted and dropped when
/// it ends, which closes the socket on every exit path.
pub struct Session<S> {
    stream: BufStream<S>,
    peer: SocketAddr,
    context: HandlerContext,
    rng: StdRng,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S, peer: SocketAddr, context: HandlerContext) -> Self {
        Self {
            stream: BufStream::new(stream),
            peer,
            context,
            rng: StdRng::from_entropy(),
        }
    }

    /// Serve the connection to completion. Errors are logged, never returned.
    pub async fn run(mut self) {
        match self.serve().await {
            Ok(()) => debug!(peer = %self.peer, "Connection closed by client"),
            Err(e) => warn!(peer = %self.peer, error = %e, "Connection error, closing"),
        }
    }

    async fn serve(&mut self) -> Result<(), FrameError> {
        while let Some(frame) = read_frame(&mut self.stream).await? {
            self.context.sink.record(
                Action::Received,
                format!("{} with data size {}", frame.command, frame.payload.len()),
            );

            match frame.kind() {
                Command::Who => {
                    let identity = Arc::clone(&self.context.identity);
                    self.send_text(&identity).await?;
                }
                Command::Test => {
                    if self.handle_test(frame.payload.len()).await?.is_break() {
                        debug!(peer = %self.peer, "Peer closed before acknowledging push");
                        return Ok(());
                    }
                }
                Command::Unrecognized(command) => {
                    debug!(peer = %self.peer, command = %command, "Unrecognized command");
                    self.send_text(UNRECOGNIZED_RESPONSE).await?;
                }
            }
        }

        Ok(())
    }

    /// Acknowledge the request, push a random-size TEST frame, then wait
    /// for the peer's acknowledgement of the push.
    async fn handle_test(&mut self, received: usize) -> Result<ControlFlow<()>, FrameError> {
        self.send_text(&test_ack(received)).await?;

        let size = self.context.payload.sample(&mut self.rng);
        write_frame(&mut self.stream, &Frame::filler(size)).await?;
        self.context
            .sink
            .record(Action::Sent, format!("TEST with data size {size}"));

        match read_frame(&mut self.stream).await? {
            Some(ack) => {
                self.context.sink.record(Action::Received, ack.payload_text());
                Ok(ControlFlow::Continue(()))
            }
            None => Ok(ControlFlow::Break(())),
        }
    }

    async fn send_text(&mut self, text: &str) -> Result<(), FrameError> {
        write_frame(&mut self.stream, &Frame::text(text)).await?;
        self.context.sink.record(Action::Sent, text);
        Ok(())
    }
}
