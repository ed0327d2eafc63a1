use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::{
    errors::{StreamError, StreamResult},
    types::ListenKey,
};

/// Opens message-stream connections keyed by a listen key.
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    async fn connect(&self, key: &ListenKey) -> StreamResult<Box<dyn MessageStream>>;
}

/// A long-lived connection delivering one text payload per frame.
///
/// Read deadlines are enforced by the caller, implementations only need to block
/// until the next data frame arrives.
#[async_trait]
pub trait MessageStream: Send {
    /// Next data frame. Control frames are handled internally; a close frame or end of
    /// stream yields [`StreamError::Closed`].
    async fn read_frame(&mut self) -> StreamResult<String>;

    async fn close(&mut self);
}

/// Dials `<stream_url><listenKey>` over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base: Url,
}

impl WsConnector {
    pub fn new(stream_url: &str) -> StreamResult<Self> {
        Ok(Self {
            base: build_base_url(stream_url)?,
        })
    }

    pub fn url_for(&self, key: &ListenKey) -> StreamResult<Url> {
        Ok(self.base.join(key.as_str())?)
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, key: &ListenKey) -> StreamResult<Box<dyn MessageStream>> {
        let url = self.url_for(key)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| StreamError::Dial(err.to_string()))?;
        tracing::info!(host = url.host_str().unwrap_or_default(), "user data stream connected");
        Ok(Box::new(WsConnection { stream }))
    }
}

#[derive(Debug)]
pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl MessageStream for WsConnection {
    async fn read_frame(&mut self) -> StreamResult<String> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(binary))) => {
                    return String::from_utf8(binary).map_err(|_| {
                        StreamError::Decode("invalid utf8 payload".to_string())
                    });
                }
                // tungstenite queues the pong itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        tracing::info!(
                            code = u16::from(frame.code),
                            reason = %frame.reason,
                            "user data stream close frame"
                        );
                    }
                    return Err(StreamError::Closed);
                }
                Some(Err(err)) => return Err(StreamError::Read(err.to_string())),
                None => return Err(StreamError::Closed),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            tracing::debug!(error = %err, "user data stream close failed");
        }
        let _ = self.stream.flush().await;
    }
}

fn build_base_url(stream_url: &str) -> StreamResult<Url> {
    let mut candidate = stream_url.to_string();
    if candidate.starts_with("https://") {
        candidate = candidate.replacen("https://", "wss://", 1);
    } else if candidate.starts_with("http://") {
        candidate = candidate.replacen("http://", "ws://", 1);
    } else if !candidate.starts_with("ws://") && !candidate.starts_with("wss://") {
        candidate = format!("wss://{candidate}");
    }
    if !candidate.ends_with('/') {
        candidate.push('/');
    }
    Ok(Url::parse(&candidate)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_listen_key() {
        let connector = WsConnector::new("wss://fstream.apollox.finance/ws/").unwrap();
        let url = connector.url_for(&ListenKey::new("abc123")).unwrap();
        assert_eq!(url.as_str(), "wss://fstream.apollox.finance/ws/abc123");
    }

    #[test]
    fn test_base_url_normalisation() {
        assert_eq!(
            build_base_url("https://fstream.apollox.finance/ws").unwrap().as_str(),
            "wss://fstream.apollox.finance/ws/"
        );
        assert_eq!(
            build_base_url("localhost:9000/ws").unwrap().as_str(),
            "wss://localhost:9000/ws/"
        );
        assert_eq!(
            build_base_url("http://127.0.0.1:9000").unwrap().as_str(),
            "ws://127.0.0.1:9000/"
        );
    }
}
