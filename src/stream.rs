//! The message stream (C3): wraps the transport's byte channel and a
//! [`Framer`], and fans out classified [`Message`]s to any number of
//! subscribers over a hot [`tokio::sync::broadcast`] channel.
//!
//! The broadcast-channel fan-out is grounded on `rt-ui-log`'s and
//! `state.rs`'s use of `broadcast` in iwismer-rusty-timer for the same
//! "many readers, one live source" shape; the teacher repo's own
//! `esl::connection` has only a single reader so it didn't need this, but
//! spec.md §5 requires `messages`/`events`/`channel_events` to all observe
//! the same underlying feed independently.

use crate::error::EslError;
use crate::frame::Framer;
use crate::message::Message;
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

const CHANNEL_CAPACITY: usize = 1024;

/// One item delivered to a [`MessageStream`] subscriber.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Message(Arc<Message>),
    /// The upstream transport or framer failed fatally. No further
    /// `Message` items will follow; the sender side of the broadcast
    /// channel is dropped right after this is sent.
    Error(Arc<EslError>),
}

/// Reads framed messages off a transport and republishes them to any
/// number of subscribers.
pub struct MessageStream {
    tx: broadcast::Sender<StreamEvent>,
}

impl MessageStream {
    /// Spawns the background task that drains `reader`, feeds a
    /// [`Framer`], and republishes. `transport` is disposed whenever the
    /// upstream ends, whether cleanly (EOF) or with an error, so a single
    /// failure on the read side tears down the whole connection per
    /// spec.md §2.
    pub fn spawn(reader: mpsc::Receiver<crate::error::Result<Vec<u8>>>, transport: Arc<Transport>) -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        let tx_task = tx.clone();
        tokio::spawn(async move {
            run(reader, tx_task, transport).await;
        });
        Self { tx }
    }

    /// Subscribe to the live feed. Subscribers that lag behind are skipped
    /// forward transparently by [`Subscription::next`] rather than treated
    /// as an error.
    pub fn subscribe(&self) -> Subscription {
        Subscription { inner: self.tx.subscribe() }
    }
}

async fn run(
    mut reader: mpsc::Receiver<crate::error::Result<Vec<u8>>>,
    tx: broadcast::Sender<StreamEvent>,
    transport: Arc<Transport>,
) {
    let mut framer = Framer::new();
    while let Some(chunk) = reader.recv().await {
        match chunk {
            Ok(bytes) => match framer.feed(&bytes) {
                Ok(frames) => {
                    for frame in frames {
                        let msg = Message::classify(frame);
                        // No subscribers is not an error; broadcast::send
                        // only fails when every receiver has been dropped.
                        let _ = tx.send(StreamEvent::Message(Arc::new(msg)));
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "ESL framing error, tearing down connection");
                    let _ = tx.send(StreamEvent::Error(Arc::new(err)));
                    transport.dispose();
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "ESL transport read failed, tearing down connection");
                let _ = tx.send(StreamEvent::Error(Arc::new(err)));
                transport.dispose();
                return;
            }
        }
    }
    // Clean EOF: the peer closed the socket.
    transport.dispose();
}

/// A subscriber's handle onto the live message feed.
pub struct Subscription {
    inner: broadcast::Receiver<StreamEvent>,
}

impl Subscription {
    /// Await the next event, transparently resuming past any messages
    /// missed while lagged rather than surfacing
    /// [`broadcast::error::RecvError::Lagged`] to callers. Returns `None`
    /// once the feed has closed (connection disposed, cleanly or not).
    pub async fn next(&mut self) -> Option<StreamEvent> {
        loop {
            match self.inner.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "message stream subscriber lagged, skipping ahead");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        (server, client.await.unwrap())
    }

    #[tokio::test]
    async fn republishes_classified_messages_to_subscriber() {
        let (server, mut client) = connected_pair().await;
        let transport = Arc::new(Transport::new(server));
        let reader = transport.take_reader().unwrap();
        let stream = MessageStream::spawn(reader, transport);
        let mut sub = stream.subscribe();

        use tokio::io::AsyncWriteExt;
        client
            .write_all(b"Content-Type: command/reply\nReply-Text: +OK\n\n")
            .await
            .unwrap();

        match sub.next().await.unwrap() {
            StreamEvent::Message(msg) => match msg.as_ref() {
                Message::CommandReply(r) => assert!(r.success()),
                other => panic!("unexpected message: {other:?}"),
            },
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_disconnect_disposes_transport_and_closes_feed() {
        let (server, client) = connected_pair().await;
        let transport = Arc::new(Transport::new(server));
        let reader = transport.take_reader().unwrap();
        let stream = MessageStream::spawn(reader, transport.clone());
        let mut sub = stream.subscribe();

        drop(client);

        assert!(sub.next().await.is_none());
        assert!(transport.is_disposed());
    }

    #[tokio::test]
    async fn malformed_content_length_sends_error_then_closes() {
        let (server, mut client) = connected_pair().await;
        let transport = Arc::new(Transport::new(server));
        let reader = transport.take_reader().unwrap();
        let stream = MessageStream::spawn(reader, transport.clone());
        let mut sub = stream.subscribe();

        use tokio::io::AsyncWriteExt;
        client.write_all(b"Content-Length: not-a-number\n\n").await.unwrap();

        match sub.next().await.unwrap() {
            StreamEvent::Error(err) => assert!(matches!(err.as_ref(), EslError::ProtocolViolation(_))),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(sub.next().await.is_none());
    }
}
