use crate::{
    logging::{connection_error_event, connection_event},
    wire::{frame_length, Message, ProtocolError, LENGTH_OCTETS},
};
use std::{io, net::SocketAddr, sync::Arc};
use thiserror::Error as ThisError;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

/// Receives every message that arrives on the connections of one process.
///
/// `on_message` runs on the receive task of the connection the message came
/// in on, so the next frame from that peer is not read until it returns.
/// Messages from different connections may be handled concurrently.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn on_message(self: Arc<Self>, message: Message, connection: SharedConnection);
}

pub type SharedConnection = Arc<Connection>;

/// One live link to a peer.
#[derive(Debug)]
pub struct Connection {
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
}

impl Connection {
    /// Takes ownership of a connected stream and starts its drain and receive
    /// tasks. Must be called from within a tokio runtime.
    pub fn spawn(
        stream: TcpStream,
        handler: Arc<dyn Handler>,
        max_frame_length: usize,
    ) -> Result<SharedConnection, StreamError> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let connection = Arc::new(Self {
            peer_addr,
            local_addr,
            outbound,
            closed: closed.clone(),
        });
        connection_event(local_addr, peer_addr, "open");

        tokio::spawn(drain(writer, queue, closed, peer_addr));
        tokio::spawn(receive(
            reader,
            handler,
            connection.clone(),
            max_frame_length,
        ));
        Ok(connection)
    }

    /// Appends a message to the outbound queue. Never blocks. Messages
    /// enqueued from one task reach the peer in the order they were enqueued.
    pub fn enqueue(&self, message: Message) -> Result<(), StreamError> {
        if self.closed.is_cancelled() {
            Err(StreamError::Closed)?
        }
        self.outbound
            .send(message)
            .map_err(|_| StreamError::Closed)
    }

    /// Tears down both tasks. Messages already queued are still written.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has closed for any reason.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// The remote address as observed on the socket.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn drain(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Message>,
    closed: CancellationToken,
    peer_addr: SocketAddr,
) {
    loop {
        let message = tokio::select! {
            biased;
            message = queue.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = closed.cancelled() => break,
        };
        if let Err(e) = writer.write_all(&message.frame()).await {
            connection_error_event(peer_addr, &e);
            break;
        }
    }
    closed.cancel();
    let _ = writer.shutdown().await;
}

async fn receive(
    mut reader: OwnedReadHalf,
    handler: Arc<dyn Handler>,
    connection: SharedConnection,
    max_frame_length: usize,
) {
    loop {
        let next = tokio::select! {
            next = read_frame(&mut reader, max_frame_length) => next,
            _ = connection.closed() => break,
        };
        match next {
            Ok(Some(message)) => handler.clone().on_message(message, connection.clone()).await,
            Ok(None) => break,
            Err(e) => {
                connection_error_event(connection.peer_addr, &e);
                break;
            }
        }
    }
    connection.close();
    connection_event(connection.local_addr, connection.peer_addr, "closed");
}

/// Reads one frame. Returns `None` if the peer closed the stream cleanly
/// between frames.
async fn read_frame(
    reader: &mut OwnedReadHalf,
    max_frame_length: usize,
) -> Result<Option<Message>, StreamError> {
    let mut prefix = [0u8; LENGTH_OCTETS];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => Err(e)?,
    }
    let len = frame_length(prefix, max_frame_length)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Message::decode(&payload)?))
}

#[derive(Debug, ThisError)]
pub enum StreamError {
    #[error("The connection is closed")]
    Closed,
    #[error("I/O error on the connection: {0}")]
    Io(#[from] io::Error),
    #[error("The peer sent a malformed frame: {0}")]
    Protocol(#[from] ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeId, PeerAddress};
    use std::time::Duration;
    use tokio::{net::TcpListener, time::timeout};

    const WAIT: Duration = Duration::from_secs(5);

    /// Forwards every received message into a channel.
    struct Collect(mpsc::UnboundedSender<Message>);

    #[async_trait::async_trait]
    impl Handler for Collect {
        async fn on_message(self: Arc<Self>, message: Message, _connection: SharedConnection) {
            let _ = self.0.send(message);
        }
    }

    fn collector() -> (Arc<dyn Handler>, mpsc::UnboundedReceiver<Message>) {
        let (send, recv) = mpsc::unbounded_channel();
        (Arc::new(Collect(send)), recv)
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dialed = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        (dialed, accepted)
    }

    fn packet(n: i32) -> Message {
        Message::DataPacket {
            dst: NodeId::new(1).unwrap(),
            src: NodeId::new(2).unwrap(),
            payload: n,
            trace: vec![],
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    #[tracing_test::traced_test]
    async fn delivers_in_enqueue_order() {
        let (dialed, accepted) = pair().await;
        let (quiet, _) = collector();
        let (handler, mut inbox) = collector();
        let sender = Connection::spawn(dialed, quiet, 1024).unwrap();
        let _receiver = Connection::spawn(accepted, handler, 1024).unwrap();

        for n in 0..100 {
            sender.enqueue(packet(n)).unwrap();
        }
        for n in 0..100 {
            let message = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
            assert_eq!(message, packet(n));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn enqueue_fails_after_close() {
        let (dialed, accepted) = pair().await;
        let (quiet, _) = collector();
        let (handler, _inbox) = collector();
        let sender = Connection::spawn(dialed, quiet, 1024).unwrap();
        let receiver = Connection::spawn(accepted, handler, 1024).unwrap();

        sender.close();
        assert!(matches!(
            sender.enqueue(Message::TrafficSummaryRequest),
            Err(StreamError::Closed)
        ));
        // the peer sees EOF and closes its side too
        timeout(WAIT, receiver.closed()).await.unwrap();
        assert!(receiver.is_closed());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[tracing_test::traced_test]
    async fn oversized_frame_drops_connection() {
        let (dialed, accepted) = pair().await;
        let (quiet, _) = collector();
        let (handler, mut inbox) = collector();
        let sender = Connection::spawn(dialed, quiet, 1024).unwrap();
        let receiver = Connection::spawn(accepted, handler, 16).unwrap();

        sender
            .enqueue(Message::NodeRegisters {
                address: PeerAddress::new("a-rather-long-host-name.example", 1),
            })
            .unwrap();
        timeout(WAIT, receiver.closed()).await.unwrap();
        assert!(inbox.try_recv().is_err());
    }
}
