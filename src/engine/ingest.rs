use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::gateway::LineStream;

/// Read lines from the gateway into `tx` until shutdown, reconnecting
/// whenever the connection ends, errors or goes quiet for `read_timeout`.
pub(crate) async fn read_gateway(
    addr: SocketAddr,
    tx: mpsc::Sender<String>,
    read_timeout: Duration,
    reconnect_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let connected = tokio::select! {
            res = LineStream::connect(addr) => res,
            _ = shutdown.changed() => return,
        };

        match connected {
            Ok(mut stream) => {
                info!(%addr, "Engine connected to gateway");
                loop {
                    let next = tokio::select! {
                        res = stream.next_line(read_timeout) => res,
                        _ = shutdown.changed() => return,
                    };
                    match next {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            if tx.send(line).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            info!(%addr, "Gateway closed the stream");
                            break;
                        }
                        Err(e) => {
                            warn!(%addr, error = %e, "Gateway read failed, reconnecting");
                            break;
                        }
                    }
                }
            }
            Err(e) => debug!(%addr, error = %e, "Gateway not reachable yet"),
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}
