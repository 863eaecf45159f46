//! Opening connections: accepting peers and dialing out.

use crate::broker::{Broker, Connection};
use crate::config::BrokerOptions;
use crate::error::BrokerError;
use crate::flavor::Referenceable;
use crate::reference::RemoteReference;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_tungstenite::WebSocketStream;

/// Supplies the object a new connection exposes at id 0.
pub trait Root: Send + Sync + 'static {
    fn root_object(&self, broker: &Broker) -> Arc<dyn Referenceable>;
}

/// Expose the same object on every connection.
pub struct SharedRoot(Arc<dyn Referenceable>);

impl SharedRoot {
    pub fn new<T: Referenceable>(object: Arc<T>) -> Self {
        Self(object)
    }
}

impl Root for SharedRoot {
    fn root_object(&self, _: &Broker) -> Arc<dyn Referenceable> {
        self.0.clone()
    }
}

/// Run the server side of an accepted WebSocket.
///
/// Returns immediately; the connection runs on its own task until either
/// side closes it.
pub fn serve<S>(ws: WebSocketStream<S>, root: &dyn Root, options: BrokerOptions) -> Broker
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (broker, _ready) = Connection::start(ws, options, Some(root));
    broker
}

/// Run the client side of a WebSocket and wait for the handshake.
///
/// Returns the connection and a reference to the peer's root object.
pub async fn client<S>(
    ws: WebSocketStream<S>,
    options: BrokerOptions,
) -> Result<(Broker, RemoteReference), BrokerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (broker, ready) = Connection::start(ws, options, None);
    ready.await.map_err(|_| BrokerError::Closed)??;
    let root = RemoteReference::root(broker.clone());
    Ok((broker, root))
}

/// Dial `url` (`ws://host:port/`) and return the server's root object.
pub async fn connect(
    url: &str,
    options: BrokerOptions,
) -> Result<(Broker, RemoteReference), BrokerError> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    tracing::debug!("connected to {}", url);
    client(ws, options).await
}

/// Accepts WebSocket connections and serves a root on each.
pub struct Server {
    listener: TcpListener,
    root: Arc<dyn Root>,
    options: BrokerOptions,
}

impl Server {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        root: Arc<dyn Root>,
        options: BrokerOptions,
    ) -> Result<Self, BrokerError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            root,
            options,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BrokerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> Result<(), BrokerError> {
        tracing::info!("Listening on ws://{}", self.local_addr()?);

        loop {
            let (stream, peer) = self.listener.accept().await?;
            let root = self.root.clone();
            let options = self.options.clone();

            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => {
                        let broker = serve(ws, root.as_ref(), options);
                        tracing::debug!("broker {} serving {}", broker.id(), peer);
                    }
                    Err(e) => tracing::warn!("WebSocket handshake with {} failed: {}", peer, e),
                }
            });
        }
    }
}

/// Bind `addr` and serve `root` on every connection.
pub async fn listen(
    addr: impl ToSocketAddrs,
    root: Arc<dyn Root>,
    options: BrokerOptions,
) -> Result<(), BrokerError> {
    Server::bind(addr, root, options).await?.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::{HandlerFuture, Invocation};
    use crate::value::Value;
    use futures_util::future::ready;

    struct Hello;

    impl Referenceable for Hello {
        fn remote_message(self: Arc<Self>, _: Invocation) -> HandlerFuture {
            Box::pin(ready(Ok(Value::from("hello"))))
        }
    }

    #[tokio::test]
    async fn server_accepts_and_answers() {
        let server = Server::bind(
            "127.0.0.1:0",
            Arc::new(SharedRoot::new(Arc::new(Hello))),
            BrokerOptions::default(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let (broker, root) = connect(&format!("ws://{addr}/"), BrokerOptions::default())
            .await
            .unwrap();
        assert!(broker.is_connected());
        let answer = root.call_remote("greet", ()).await.unwrap();
        assert_eq!(answer.as_str(), Some("hello"));
        broker.close();
        broker.closed().await;
    }
}
