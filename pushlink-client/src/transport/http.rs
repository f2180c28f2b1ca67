//! HTTP transport.
//!
//! The session conversation rides a streaming POST whose chunked response
//! body is read line by line; control requests travel as separate short
//! POST exchanges whose response bodies carry the acknowledgment lines.
//! Request bodies always declare a Content-Length, which also satisfies
//! proxies that refuse chunked uploads (the content-length-required mode).

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use log::{debug, trace};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use url::Url;

use pushlink_core::Request;

use crate::environment::environment;
use crate::transport::{Connector, StreamConnection, TransportError};

/// Map a configured server address and verb to the HTTP request URL.
pub(crate) fn http_url(address: &str, verb: &str) -> Result<Url, TransportError> {
    let mut url =
        Url::parse(address).map_err(|e| TransportError::BadAddress(format!("{address}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "https" => None,
        "ws" => Some("http"),
        "wss" => Some("https"),
        other => {
            return Err(TransportError::BadAddress(format!(
                "unsupported scheme {other}"
            )))
        }
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|_| TransportError::BadAddress(address.to_string()))?;
    }
    url.set_path(&format!("/pushlink/{verb}"));
    Ok(url)
}

pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new() -> Result<HttpConnector, TransportError> {
        let env = environment();
        let client = reqwest::Client::builder()
            .cookie_provider(env.cookie_jar.clone())
            .danger_accept_invalid_certs(env.accept_invalid_certs)
            .build()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(HttpConnector { client })
    }

    async fn post(&self, address: &str, request: &Request) -> Result<reqwest::Response, TransportError> {
        let url = http_url(address, request.verb())?;
        debug!("http post {url}");
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(request.encode_params())
            .send()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Rejected(response.status().to_string()));
        }
        Ok(response)
    }

    /// One short control-path exchange; the whole response body is the
    /// acknowledgment lines.
    pub async fn request_lines(
        &self,
        address: &str,
        request: &Request,
    ) -> Result<Vec<String>, TransportError> {
        let response = self.post(address, request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(body
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn open(
        &self,
        address: &str,
        request: Option<&Request>,
        abort: &CancellationToken,
    ) -> Result<Box<dyn StreamConnection>, TransportError> {
        let Some(request) = request else {
            // There is no handshake to pre-open on HTTP.
            return Err(TransportError::Handshake(
                "http transport cannot open without a request".to_string(),
            ));
        };
        let response = tokio::select! {
            _ = abort.cancelled() => return Err(TransportError::Aborted),
            r = self.post(address, request) => r?,
        };
        let stream: BoxStream<'static, std::io::Result<Bytes>> = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();
        Ok(Box::new(HttpConnection {
            lines: FramedRead::new(StreamReader::new(stream), LinesCodec::new()),
            closed: false,
        }))
    }
}

pub struct HttpConnection {
    lines: FramedRead<StreamReader<BoxStream<'static, std::io::Result<Bytes>>, Bytes>, LinesCodec>,
    closed: bool,
}

#[async_trait]
impl StreamConnection for HttpConnection {
    async fn send(&mut self, _request: &Request) -> Result<(), TransportError> {
        Err(TransportError::Io(
            "http stream connection is read-only".to_string(),
        ))
    }

    async fn next_line(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            if self.closed {
                return None;
            }
            match self.lines.next().await {
                Some(Ok(line)) => {
                    let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
                    if !line.is_empty() {
                        trace!("http line: {line:?}");
                        return Some(Ok(line));
                    }
                }
                Some(Err(e)) => {
                    self.closed = true;
                    return Some(Err(TransportError::Io(e.to_string())));
                }
                None => {
                    self.closed = true;
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) {
        // Dropping the body stream aborts the request.
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_url_schemes() {
        assert_eq!(
            http_url("ws://push.example.com:8080", "create_session")
                .unwrap()
                .as_str(),
            "http://push.example.com:8080/pushlink/create_session"
        );
        assert_eq!(
            http_url("https://push.example.com", "control").unwrap().as_str(),
            "https://push.example.com/pushlink/control"
        );
        assert!(http_url("mailto:x@y", "msg").is_err());
    }
}
