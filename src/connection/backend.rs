use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::Error;

use super::types::{ConnectionDetails, Frame, Transport};

/// Real websocket [`Transport`], grounded on `ethers-providers`'
/// `ws/backend.rs`: connects with `tokio-tungstenite`, forwards `Text`
/// frames, ignores `Ping`/`Pong`/`Frame`, and surfaces `Binary`/`Close` as
/// errors (this crate's wire format is JSON text only).
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl WsTransport {
    #[tracing::instrument(skip(details), fields(url = %details.url))]
    pub async fn connect(details: ConnectionDetails) -> Result<Self, Error> {
        let (stream, _response) = tokio_tungstenite::connect_async(details.url).await?;
        Ok(WsTransport { stream })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), Error> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Frame, Error> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Frame::Text(text)),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Binary(_))) => {
                    return Err(Error::Api("unexpected binary frame".into()));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(Frame::Closed),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.stream.close(None).await?;
        Ok(())
    }
}
