//! TCP transport with length-delimited postcard frames
//!
//! Each accepted stream gets two tasks: a reader that decodes frames and posts
//! them to the host in arrival order, and a writer that drains an unbounded
//! queue so [`Channel::send`] never blocks the broker. Closing the channel
//! cancels both.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Channel, TransportError};
use crate::codec;
use crate::error::BrokerResult;
use crate::host::HostHandle;
use crate::protocol::Transmission;

/// Largest frame accepted from a peer
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub(crate) fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Broker-side end of a TCP connection
pub struct TcpChannel {
    outbound: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
    remote: SocketAddr,
}

impl Channel for TcpChannel {
    fn send(&mut self, transmission: &Arc<Transmission>) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let bytes = codec::encode(transmission)?;
        self.outbound
            .send(Bytes::from(bytes))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        self.cancel.cancel();
    }

    fn remote_endpoint(&self) -> String {
        format!("tcp:{}", self.remote)
    }
}

/// Accept guests until cancelled
pub async fn serve(listener: TcpListener, host: HostHandle, cancel: CancellationToken) -> BrokerResult<()> {
    info!(addr = ?listener.local_addr().ok(), "listening for guests");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, remote) = accepted.map_err(|e| {
                    error!(error = %e, "accept failed");
                    e
                })?;
                tokio::spawn(connection_task(stream, remote, host.clone()));
            }
        }
    }
}

async fn connection_task(stream: TcpStream, remote: SocketAddr, host: HostHandle) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(%remote, error = %e, "failed to set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, frame_codec());
    let mut writer = FramedWrite::new(write_half, frame_codec());
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let cancel = CancellationToken::new();

    let channel = TcpChannel {
        outbound: tx,
        cancel: cancel.clone(),
        remote,
    };
    let Ok(peer) = host.accept(Box::new(channel)).await else {
        debug!(%remote, "host stopped before accepting");
        return;
    };

    let writer_cancel = cancel.clone();
    let writer_host = host.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                next = rx.recv() => match next {
                    Some(bytes) => {
                        if let Err(e) = writer.send(bytes).await {
                            let _ = writer_host.transport_error(peer, e.into());
                            break;
                        }
                    }
                    None => break,
                },
                _ = writer_cancel.cancelled() => {
                    // Flush what was queued before the close, e.g. a final error notice.
                    while let Ok(bytes) = rx.try_recv() {
                        if writer.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = SinkExt::<Bytes>::close(&mut writer).await;
        debug!(peer, "writer stopped");
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.next() => {
                let result = match frame {
                    Some(Ok(bytes)) => match codec::decode(&bytes) {
                        Ok(transmission) => host.frame(peer, transmission),
                        Err(e) => {
                            let _ = host.transport_error(peer, e);
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        let _ = host.transport_error(peer, e.into());
                        break;
                    }
                    None => {
                        let _ = host.transport_error(peer, TransportError::Closed);
                        break;
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        }
    }
    debug!(peer, %remote, "reader stopped");
}
