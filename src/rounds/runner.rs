//! Echo round runner.
//!
//! One listener is bound before any round and reused for the whole run. Each
//! round spawns a single sender task that waits for the receiver's readiness
//! signal, connects, writes the payload plus `\n` and closes. The driver side
//! accepts and reads with a bounded wait, then classifies what it saw. The
//! sender is never joined; its only visible effect is the bytes on the wire.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::outcome::{classify, trim_line_terminator, Observation, TestOutcome};
use super::payload::TestCase;
use crate::config::RoundsConfig;
use crate::error::HarnessError;
use crate::report::ResultAccumulator;

/// Drives bounded sender/receiver exchanges over one listening socket
#[derive(Debug)]
pub struct EchoRoundRunner {
    listener: TcpListener,
    local_addr: SocketAddr,
    connect_addr: SocketAddr,
    accept_timeout: Duration,
    settle_delay: Duration,
    buffer_size: usize,
}

impl EchoRoundRunner {
    /// Bind the receiving listener
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Bind failures are fatal for the run and surface as
    /// [`HarnessError::Bind`].
    pub fn bind(config: &RoundsConfig) -> Result<Self, HarnessError> {
        let bind_ip: IpAddr = config.bind_address.parse().map_err(|_| {
            HarnessError::Precondition(format!("invalid bind address {}", config.bind_address))
        })?;
        let connect_ip: IpAddr = config.connect_address.parse().map_err(|_| {
            HarnessError::Precondition(format!(
                "invalid connect address {}",
                config.connect_address
            ))
        })?;

        let address = SocketAddr::new(bind_ip, config.port);
        let bind_error = |source| HarnessError::Bind {
            address: address.to_string(),
            source,
        };

        let listener = listen(address, config.backlog).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        info!("Receiver listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            connect_addr: SocketAddr::new(connect_ip, local_addr.port()),
            accept_timeout: config.accept_timeout(),
            settle_delay: config.settle_delay(),
            buffer_size: config.buffer_size,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address senders connect to
    pub fn connect_addr(&self) -> SocketAddr {
        self.connect_addr
    }

    /// Run every case in order, recording each outcome into `acc`
    pub async fn run_rounds(&self, cases: Vec<TestCase>, mut acc: ResultAccumulator) -> ResultAccumulator {
        for case in cases {
            let outcome = self.run_round(case).await;
            acc.record(&outcome);
            tokio::time::sleep(self.settle_delay).await;
        }
        acc
    }

    /// Execute one round and classify it
    pub async fn run_round(&self, case: TestCase) -> TestOutcome {
        let (ready_tx, ready_rx) = oneshot::channel();

        let mut wire = Vec::with_capacity(case.len() + 1);
        wire.extend_from_slice(&case.payload);
        wire.push(b'\n');
        spawn_sender(self.connect_addr, wire, ready_rx, self.accept_timeout);

        // The listener is already bound, so the sender may connect as soon as
        // the signal lands; the connection waits in the backlog until accept.
        let _ = ready_tx.send(());
        let observation = self.receive().await;
        debug!(
            "Round {} ({}): observed {:?}",
            case.round_index,
            case.expected,
            observation_kind(&observation)
        );

        classify(case, &observation)
    }

    /// Accept one connection and read up to the buffer size, both bounded by
    /// the accept timeout
    pub async fn receive(&self) -> Observation {
        let (mut stream, peer) = match timeout(self.accept_timeout, self.listener.accept()).await {
            Err(_) => return Observation::TimedOut,
            Ok(Err(e)) => {
                debug!("Accept failed: {}", e);
                return Observation::Reset;
            }
            Ok(Ok(pair)) => pair,
        };
        debug!("Accepted connection from {}", peer);

        let mut buf = vec![0u8; self.buffer_size];
        match timeout(self.accept_timeout, stream.read(&mut buf)).await {
            Err(_) => Observation::TimedOut,
            Ok(Err(e)) => {
                debug!("Read from {} failed: {}", peer, e);
                Observation::Reset
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                Observation::Received(trim_line_terminator(buf))
            }
        }
    }
}

fn listen(address: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = match address {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(address)?;
    socket.listen(backlog)
}

fn spawn_sender(
    addr: SocketAddr,
    wire: Vec<u8>,
    ready: oneshot::Receiver<()>,
    limit: Duration,
) {
    tokio::spawn(async move {
        if ready.await.is_err() {
            debug!("Receiver dropped before signalling readiness");
            return;
        }

        let send = async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_all(&wire).await?;
            stream.shutdown().await
        };

        match timeout(limit, send).await {
            Ok(Ok(())) => debug!("Sent {} bytes to {}", wire.len(), addr),
            Ok(Err(e)) => warn!("Error while sending test string to {}: {}", addr, e),
            Err(_) => warn!("Sender to {} timed out after {:?}", addr, limit),
        }
    });
}

fn observation_kind(observation: &Observation) -> String {
    match observation {
        Observation::Received(bytes) => format!("{} bytes", bytes.len()),
        Observation::TimedOut => "timeout".to_string(),
        Observation::Reset => "reset".to_string(),
    }
}
