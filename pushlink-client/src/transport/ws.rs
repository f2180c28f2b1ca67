//! WebSocket transport.
//!
//! One socket carries the whole conversation: requests go out as text
//! frames, inbound frames hold one or more directive lines. The connector
//! can also open the socket without sending anything, which is how early
//! open overlaps the handshake with the HTTP create round-trip.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, trace};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, COOKIE};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use pushlink_core::Request;

use crate::environment::environment;
use crate::transport::{Connector, StreamConnection, TransportError};

/// Path the server serves the push endpoint on.
const ENDPOINT_PATH: &str = "/pushlink";

/// Map a configured server address to the WebSocket endpoint URL.
pub(crate) fn ws_url(address: &str) -> Result<Url, TransportError> {
    let mut url =
        Url::parse(address).map_err(|e| TransportError::BadAddress(format!("{address}: {e}")))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(with_path(url)),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(TransportError::BadAddress(format!(
                "unsupported scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::BadAddress(address.to_string()))?;
    Ok(with_path(url))
}

fn with_path(mut url: Url) -> Url {
    url.set_path(ENDPOINT_PATH);
    url
}

pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(
        &self,
        address: &str,
        request: Option<&Request>,
        abort: &CancellationToken,
    ) -> Result<Box<dyn StreamConnection>, TransportError> {
        let url = ws_url(address)?;
        debug!("opening websocket against {url}");

        let mut handshake = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        // Share the process-wide cookie jar with the HTTP stack.
        let env = environment();
        if let Some(cookies) = reqwest::cookie::CookieStore::cookies(&*env.cookie_jar, &url) {
            if let Ok(value) = HeaderValue::from_bytes(cookies.as_bytes()) {
                handshake.headers_mut().insert(COOKIE, value);
            }
        }

        let socket = tokio::select! {
            _ = abort.cancelled() => return Err(TransportError::Aborted),
            r = connect_async(handshake) => {
                let (socket, _response) = r.map_err(|e| TransportError::Handshake(e.to_string()))?;
                socket
            }
        };

        let mut conn = WsConnection {
            socket,
            lines: VecDeque::new(),
            closed: false,
        };
        if let Some(request) = request {
            conn.send(request).await?;
        }
        Ok(Box::new(conn))
    }
}

pub struct WsConnection {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Lines decoded from frames but not yet consumed.
    lines: VecDeque<String>,
    closed: bool,
}

impl WsConnection {
    fn push_frame(&mut self, text: &str) {
        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if !line.is_empty() {
                self.lines.push_back(line.to_string());
            }
        }
    }
}

#[async_trait]
impl StreamConnection for WsConnection {
    async fn send(&mut self, request: &Request) -> Result<(), TransportError> {
        let frame = request.ws_frame();
        trace!("ws send: {frame:?}");
        self.socket
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn next_line(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            if let Some(line) = self.lines.pop_front() {
                return Some(Ok(line));
            }
            if self.closed {
                return None;
            }
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => self.push_frame(&text),
                // Pings are answered by the library; nothing else matters.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Binary(_))) => {
                    return Some(Err(TransportError::Io(
                        "unexpected binary frame".to_string(),
                    )))
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.closed = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.closed = true;
                    return Some(Err(TransportError::Io(e.to_string())));
                }
            }
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.socket.close(None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_schemes() {
        assert_eq!(
            ws_url("http://push.example.com:8080").unwrap().as_str(),
            "ws://push.example.com:8080/pushlink"
        );
        assert_eq!(
            ws_url("https://push.example.com").unwrap().as_str(),
            "wss://push.example.com/pushlink"
        );
        assert_eq!(
            ws_url("ws://127.0.0.1:9001").unwrap().as_str(),
            "ws://127.0.0.1:9001/pushlink"
        );
        assert!(ws_url("ftp://x").is_err());
        assert!(ws_url("not a url").is_err());
    }
}
