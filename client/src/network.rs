use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{ClientMessage, ServerMessage};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// JSON message stream to the race server
pub struct Connection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    close_code: Option<CloseCode>,
    close_reason: Option<String>,
}

impl Connection {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (stream, _) = connect_async(url).await?;
        info!("Connected to {}", url);

        Ok(Connection {
            stream,
            close_code: None,
            close_reason: None,
        })
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), Box<dyn std::error::Error>> {
        let text = message.to_json()?;
        debug!("-> {}", text);
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Next server event, or `None` once the server has closed the stream
    ///
    /// Frames that do not decode as a server event are logged and skipped.
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>, Box<dyn std::error::Error>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => match ServerMessage::from_json(text.as_str()) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => warn!("Ignoring unexpected frame {}: {}", text.as_str(), e),
                },
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        self.close_code = Some(frame.code);
                        self.close_reason = Some(frame.reason.to_string());
                    }
                    return Ok(None);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }

    /// Code of the server's close frame, if one arrived
    pub fn close_code(&self) -> Option<CloseCode> {
        self.close_code
    }

    /// Reason given in the server's close frame, if one arrived
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Close failed: {}", e);
        }
    }
}
