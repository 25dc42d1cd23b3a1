//! In-process channel backed by an unbounded mpsc queue

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{Channel, TransportError};
use crate::protocol::Transmission;

/// Broker-side end of an in-process connection
pub struct LocalChannel {
    outbound: mpsc::UnboundedSender<Arc<Transmission>>,
    endpoint: String,
    closed: bool,
}

/// Create a local channel; the receiver yields everything the broker sends
pub fn channel(endpoint: impl Into<String>) -> (LocalChannel, mpsc::UnboundedReceiver<Arc<Transmission>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        LocalChannel {
            outbound: tx,
            endpoint: endpoint.into(),
            closed: false,
        },
        rx,
    )
}

impl Channel for LocalChannel {
    fn send(&mut self, transmission: &Arc<Transmission>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(Arc::clone(transmission))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn remote_endpoint(&self) -> String {
        format!("local:{}", self.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ControlMessage;

    #[test]
    fn test_send_reaches_receiver() {
        let (mut channel, mut rx) = channel("guest");
        let t = Arc::new(Transmission::control(ControlMessage::end_of_discovery()));
        channel.send(&t).unwrap();
        assert!(Arc::ptr_eq(&rx.try_recv().unwrap(), &t));
        assert_eq!(channel.remote_endpoint(), "local:guest");
    }

    #[test]
    fn test_send_after_close_fails() {
        let (mut channel, _rx) = channel("guest");
        channel.close();
        let t = Arc::new(Transmission::control(ControlMessage::end_of_discovery()));
        assert!(matches!(channel.send(&t), Err(TransportError::Closed)));
    }

    #[test]
    fn test_send_to_dropped_receiver_fails() {
        let (mut channel, rx) = channel("guest");
        drop(rx);
        let t = Arc::new(Transmission::control(ControlMessage::end_of_discovery()));
        assert!(matches!(channel.send(&t), Err(TransportError::Closed)));
    }
}
