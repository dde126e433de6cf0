use dpa_core::{check_frame_len, DiameterCodec, DpaError, Result, Transport};
use dpa_peer_runtime::{DiameterConnection, PeerLink};
use dpa_shared::{ConnectionId, DiameterMessage};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Diameter connection over a framed byte stream.
///
/// A reader task decodes frames and hands them to the owning peer (or to the
/// unowned queue until a peer adopts the connection); a writer task drains
/// the outbound queue so `write` never waits on the socket.
#[derive(Debug)]
pub struct TcpConnection {
    id: ConnectionId,
    description: String,
    outbound: mpsc::UnboundedSender<DiameterMessage>,
    owner: Mutex<Option<PeerLink>>,
    open: AtomicBool,
    closing: CancellationToken,
}

impl TcpConnection {
    /// Start the reader and writer tasks; the receiver yields messages read while unowned
    pub fn spawn<T: Transport>(
        id: ConnectionId,
        stream: T,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DiameterMessage>) {
        let description = stream.describe();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<DiameterMessage>();
        let (unowned_tx, unowned_rx) = mpsc::unbounded_channel();
        let closing = CancellationToken::new();

        let connection = Arc::new(Self {
            id,
            description,
            outbound: outbound_tx,
            owner: Mutex::new(None),
            open: AtomicBool::new(true),
            closing: closing.clone(),
        });
        debug!(connection = id, transport = %connection.description, "Connection established");

        let (mut sink, mut frames) = Framed::new(stream, DiameterCodec::new()).split();

        // Writer
        let writer_closing = closing.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    Some(message) = outbound_rx.recv() => {
                        if let Err(e) = sink.send(message).await {
                            debug!(connection = id, error = %e, "Write failed");
                            break;
                        }
                    }
                    _ = writer_closing.cancelled() => {
                        // Frames queued before the close still go out
                        while let Ok(message) = outbound_rx.try_recv() {
                            if sink.send(message).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                }
            }
            let _ = sink.close().await;
        });

        // Reader
        let weak = Arc::downgrade(&connection);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = closing.cancelled() => break,
                    next = frames.next() => next,
                };
                let Some(connection) = weak.upgrade() else { break };
                match next {
                    Some(Ok(mut message)) => {
                        message.connection = Some(id);
                        connection.dispatch(message, &unowned_tx);
                    }
                    Some(Err(e)) => {
                        debug!(connection = id, error = %e, "Dropping connection on bad frame");
                        break;
                    }
                    None => break,
                }
            }
            if let Some(connection) = weak.upgrade() {
                connection.on_remote_close();
            }
        });

        (connection, unowned_rx)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    fn dispatch(&self, message: DiameterMessage, unowned: &mpsc::UnboundedSender<DiameterMessage>) {
        let owner = self.owner.lock().clone();
        match owner {
            Some(owner) => owner.deliver(message),
            None => {
                let _ = unowned.send(message);
            }
        }
    }

    fn on_remote_close(&self) {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        self.closing.cancel();
        if was_open {
            debug!(connection = self.id, "Connection closed by remote");
            if let Some(owner) = self.owner.lock().take() {
                owner.closed(self.id);
            }
        }
    }
}

impl DiameterConnection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn set_owner(&self, owner: Option<PeerLink>) {
        *self.owner.lock() = owner;
    }

    fn write(&self, message: &DiameterMessage) -> Result<()> {
        if !self.is_open() {
            return Err(DpaError::ConnectionClosed(self.id));
        }
        // An unencodable frame would kill the writer and with it the connection
        check_frame_len(message)?;
        self.outbound
            .send(message.clone())
            .map_err(|_| DpaError::ConnectionClosed(self.id))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!(connection = self.id, "Closing connection");
        }
        self.closing.cancel();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.closing.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpa_shared::{Avp, AVP_ORIGIN_HOST, CMD_CER, CMD_DWR};
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_unowned_messages_are_queued() {
        let (local, remote) = tokio::io::duplex(4096);
        let (a, _a_unowned) = TcpConnection::spawn(1, local);
        let (_b, mut b_unowned) = TcpConnection::spawn(2, remote);

        let mut cer = DiameterMessage::request(CMD_CER, 0);
        cer.add_avp(Avp::string(AVP_ORIGIN_HOST, "dra.example.com"));
        a.write(&cer).unwrap();

        let received = timeout(Duration::from_secs(2), b_unowned.recv()).await.unwrap().unwrap();
        assert!(received.is_cer());
        assert_eq!(received.connection, Some(2));
        assert_eq!(received.origin_host().as_deref(), Some("dra.example.com"));
    }

    #[tokio::test]
    async fn test_oversized_write_rejected_and_connection_kept() {
        let (local, remote) = tokio::io::duplex(4096);
        let (a, _a_unowned) = TcpConnection::spawn(1, local);
        let (_b, mut b_unowned) = TcpConnection::spawn(2, remote);

        let mut big = DiameterMessage::request(272, 4);
        big.add_avp(Avp::new(AVP_ORIGIN_HOST, vec![0u8; 70_000]));
        assert!(matches!(a.write(&big), Err(DpaError::InvalidPacket(_))));
        assert!(a.is_open());

        a.write(&DiameterMessage::request(CMD_DWR, 0)).unwrap();
        let received = timeout(Duration::from_secs(2), b_unowned.recv()).await.unwrap().unwrap();
        assert!(received.is_dwr());
        assert!(a.is_open());
    }

    #[tokio::test]
    async fn test_close_flushes_and_remote_sees_eof() {
        let (local, remote) = tokio::io::duplex(4096);
        let (a, _a_unowned) = TcpConnection::spawn(1, local);
        let (b, mut b_unowned) = TcpConnection::spawn(2, remote);

        a.write(&DiameterMessage::request(CMD_DWR, 0)).unwrap();
        a.close();
        a.close();
        assert!(!a.is_open());
        assert!(a.write(&DiameterMessage::request(CMD_DWR, 0)).is_err());

        let received = timeout(Duration::from_secs(2), b_unowned.recv()).await.unwrap().unwrap();
        assert!(received.is_dwr());

        // Reader on the other side ends and marks the connection closed
        timeout(Duration::from_secs(2), async {
            while b.is_open() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
