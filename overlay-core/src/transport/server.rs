use super::{Connection, Handler, SharedConnection, StreamError};
use crate::{logging::connection_error_event, PeerAddress, Shutdown};
use std::{io, sync::Arc};
use thiserror::Error as ThisError;
use tokio::net::{TcpListener, TcpStream};

/// Accepts peers until `shutdown` fires, wrapping each accepted stream in a
/// [`Connection`] that reports to `handler`.
///
/// Connections accepted here are not cached. The handler learns about them
/// when their first message arrives.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    max_frame_length: usize,
    shutdown: Shutdown,
) {
    let stop = shutdown.wait_for_shutdown();
    tokio::pin!(stop);

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = &mut stop => break,
        };
        match accepted {
            Ok((stream, peer_addr)) => {
                if let Err(e) = Connection::spawn(stream, handler.clone(), max_frame_length) {
                    connection_error_event(peer_addr, &e);
                }
            }
            Err(e) => {
                tracing::error!(target: "CONNECTION", error = %e, "failed to accept connection");
            }
        }
    }
}

/// Dials `address` and starts a [`Connection`] over the new stream.
pub async fn connect(
    address: &PeerAddress,
    handler: Arc<dyn Handler>,
    max_frame_length: usize,
) -> Result<SharedConnection, DialError> {
    let stream = TcpStream::connect((address.host.as_str(), address.port))
        .await
        .map_err(|source| DialError::Unreachable {
            address: address.clone(),
            source,
        })?;
    Ok(Connection::spawn(stream, handler, max_frame_length)?)
}

#[derive(Debug, ThisError)]
pub enum DialError {
    #[error("Could not reach {address}: {source}")]
    Unreachable {
        address: PeerAddress,
        #[source]
        source: io::Error,
    },
    #[error("Connected, but the stream could not be set up: {0}")]
    Stream(#[from] StreamError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Message;
    use std::time::Duration;
    use tokio::{sync::mpsc, time::timeout};

    const WAIT: Duration = Duration::from_secs(5);

    /// Answers every message by echoing it back on the same connection.
    struct Echo;

    #[async_trait::async_trait]
    impl Handler for Echo {
        async fn on_message(self: Arc<Self>, message: Message, connection: SharedConnection) {
            let _ = connection.enqueue(message);
        }
    }

    struct Collect(mpsc::UnboundedSender<Message>);

    #[async_trait::async_trait]
    impl Handler for Collect {
        async fn on_message(self: Arc<Self>, message: Message, _connection: SharedConnection) {
            let _ = self.0.send(message);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    #[tracing_test::traced_test]
    async fn serve_and_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = PeerAddress::from(listener.local_addr().unwrap());
        let shutdown = Shutdown::new();
        let server = tokio::spawn(serve(listener, Arc::new(Echo), 1024, shutdown.clone()));

        let (send, mut inbox) = mpsc::unbounded_channel();
        let connection = connect(&address, Arc::new(Collect(send)), 1024)
            .await
            .unwrap();
        connection
            .enqueue(Message::TaskInitiate { count: 3 })
            .unwrap();
        let echoed = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
        assert_eq!(echoed, Message::TaskInitiate { count: 3 });

        shutdown.shut_down();
        timeout(WAIT, server).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unreachable_peer() {
        // bind then drop so nothing is listening on the port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = PeerAddress::from(listener.local_addr().unwrap());
        drop(listener);

        let (send, _inbox) = mpsc::unbounded_channel();
        let result = connect(&address, Arc::new(Collect(send)), 1024).await;
        assert!(matches!(result, Err(DialError::Unreachable { .. })));
    }
}
