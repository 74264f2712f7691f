//! Mock gateway clients.

use futures::{select, FutureExt, SinkExt};
use futures::stream::{SplitSink, SplitStream, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// An incoming WS stream for receiving data.
type WSIncomingStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
/// An outgoing WS sink for sending data.
type WSOutgoingSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// A client for the gateway's HTTP control surface.
pub struct GatewayClient {
    http: reqwest::Client,
    base: Url,
}

impl GatewayClient {
    pub fn new(addr: SocketAddr) -> Self {
        GatewayClient {
            http: reqwest::Client::new(),
            base: Url::parse(&format!("http://{}/", addr)).unwrap(),
        }
    }

    /// Sends a POST to `path` (which may include a query string) and returns the status code and
    /// body.
    pub async fn post(&self, path: &str) -> reqwest::Result<(u16, String)> {
        let response = self.http.post(self.url(path)).send().await?;
        let status = response.status().as_u16();

        Ok((status, response.text().await?))
    }

    pub async fn get(&self, path: &str) -> reqwest::Result<(u16, String)> {
        let response = self.http.get(self.url(path)).send().await?;
        let status = response.status().as_u16();

        Ok((status, response.text().await?))
    }

    /// Returns the parsed `GET /state` document.
    pub async fn state(&self) -> reqwest::Result<Value> {
        self.http
            .get(self.url("state"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    fn url(&self, path: &str) -> Url {
        self.base.join(path.trim_start_matches('/')).unwrap()
    }
}

/// A client subscribed to the gateway's live measurement feed.
pub struct FeedClient {
    incoming: WSIncomingStream,
    outgoing: WSOutgoingSink,
    /// Whether the connection has been closed.
    terminated: bool,
}

impl FeedClient {
    /// Returns a new `FeedClient` connected to `ws://addr`.
    pub async fn new(addr: SocketAddr) -> Result<Self, Error> {
        let url = Url::parse(&format!("ws://{}", addr)).unwrap();
        let (stream, _) = select! {
            s = tokio_tungstenite::connect_async(url).fuse() => s?,
            _ = time::sleep(Duration::from_millis(1000)).fuse() => {
                return Err(io::Error::from(io::ErrorKind::TimedOut).into());
            }
        };

        let (outgoing, incoming) = stream.split();

        Ok(FeedClient {
            incoming,
            outgoing,
            terminated: false,
        })
    }

    /// Waits for the next JSON event. Returns `None` once the gateway has closed the feed.
    pub async fn next_event(&mut self) -> Option<Value> {
        while !self.terminated {
            match self.incoming.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).ok(),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => self.terminated = true,
                // Pings and the like
                Some(Ok(_)) => {}
            }
        }

        None
    }

    /// Closes the client's WebSocket connection.
    pub async fn close(&mut self) -> Result<(), Error> {
        if !self.terminated {
            self.terminated = true;
            self.outgoing.close().await
        } else {
            Ok(())
        }
    }
}
