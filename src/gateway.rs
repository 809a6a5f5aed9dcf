//! Line-oriented TCP transport between the replay producer and the engine.
//!
//! The producer owns a [`Gateway`]: it listens, accepts one connection at a
//! time and writes whole lines to it. The engine side opens a [`LineStream`]
//! to the gateway and reads lines back.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::TransportError;

struct Connection {
    peer: SocketAddr,
    writer: BufWriter<TcpStream>,
}

pub struct Gateway {
    listener: TcpListener,
    conn: Option<Connection>,
}

impl Gateway {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => TransportError::AddressInUse { addr: addr.to_string() },
            _ => TransportError::Io(e),
        })?;
        info!(addr = %listener.local_addr()?, "Gateway listening");
        Ok(Self { listener, conn: None })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Wait for the next inbound connection. Only one may be live at a time.
    pub async fn accept(&mut self) -> Result<SocketAddr, TransportError> {
        if let Some(conn) = &self.conn {
            return Err(TransportError::AlreadyConnected { peer: conn.peer });
        }
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        info!(%peer, "Gateway accepted connection");
        self.conn = Some(Connection { peer, writer: BufWriter::new(stream) });
        Ok(peer)
    }

    /// Write `line` plus a newline and flush. A broken connection is torn
    /// down so the next `accept` can replace it.
    pub async fn write(&mut self, line: &str) -> Result<(), TransportError> {
        if line.contains('\n') {
            return Err(TransportError::InvalidLine);
        }
        let conn = self.conn.as_mut().ok_or(TransportError::NotConnected)?;

        let result = async {
            conn.writer.write_all(line.as_bytes()).await?;
            conn.writer.write_all(b"\n").await?;
            conn.writer.flush().await
        }
        .await;

        if let Err(e) = result {
            let err = TransportError::Io(e);
            if err.is_broken_pipe() {
                debug!(peer = %conn.peer, "Gateway connection lost");
                self.conn = None;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Close the active connection, if any. The listener stays open.
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.writer.flush().await;
            let _ = conn.writer.shutdown().await;
            info!(peer = %conn.peer, "Gateway connection closed");
        }
    }
}

/// Reading end of a gateway connection.
pub struct LineStream {
    peer: SocketAddr,
    lines: Lines<BufReader<TcpStream>>,
}

impl LineStream {
    pub async fn connect(addr: SocketAddr) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self { peer: addr, lines: BufReader::new(stream).lines() })
    }

    /// Next line without its terminator, `None` at end of stream. Fails with
    /// `TimedOut` if nothing arrives within `timeout`.
    pub async fn next_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        match tokio::time::timeout(timeout, self.lines.next_line()).await {
            Ok(line) => Ok(line?),
            Err(_) => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no data from {} for {:?}", self.peer, timeout),
            ))),
        }
    }
}
