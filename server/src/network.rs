//! Server network layer handling WebSocket connections and the event loop

use crate::config::ServerConfig;
use crate::connections::{ConnectionId, Outbound};
use crate::error::ServerError;
use crate::results::ResultStore;
use crate::round::{RoundCoordinator, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::ClientMessage;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Requests a running server to stop
#[derive(Debug, Clone)]
pub struct ServerHandle {
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        if self.events.send(ServerEvent::Shutdown).is_err() {
            debug!("Server already stopped");
        }
    }
}

/// Main server coordinating networking and the round coordinator
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    coordinator: RoundCoordinator,

    // Every connection task and the countdown timer feed this one channel
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    events_rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Server {
    /// Opens the result store named in `config` and binds the listener
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let store = ResultStore::open(&config.database_path)?;
        Self::bind_with_store(config, store).await
    }

    pub async fn bind_with_store(
        config: ServerConfig,
        store: ResultStore,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let coordinator = RoundCoordinator::new(&config, store, events_tx.clone());

        Ok(Server {
            listener,
            config,
            coordinator,
            events_tx,
            events_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            events: self.events_tx.clone(),
        }
    }

    /// Spawns task that accepts sockets and starts a task per connection
    fn spawn_acceptor(
        listener: TcpListener,
        events: mpsc::UnboundedSender<ServerEvent>,
        ping_interval: Duration,
        outbox_capacity: usize,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut next_id: ConnectionId = 1;

            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let conn = next_id;
                        next_id = next_id.wrapping_add(1);
                        tokio::spawn(handle_connection(
                            conn,
                            stream,
                            addr,
                            events.clone(),
                            ping_interval,
                            outbox_capacity,
                        ));
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        })
    }

    /// Main server loop: the only place coordinator state is touched
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            listener,
            config,
            mut coordinator,
            events_tx,
            mut events_rx,
        } = self;

        let acceptor = Self::spawn_acceptor(
            listener,
            events_tx.clone(),
            config.ping_interval,
            config.outbox_capacity,
        );
        info!("Server started successfully");

        while let Some(event) = events_rx.recv().await {
            if let ServerEvent::Shutdown = event {
                break;
            }
            coordinator.handle_event(event);
        }

        info!("Server shutting down");
        acceptor.abort();
        Ok(())
    }
}

/// Pumps one WebSocket: inbound frames become events, the outbox becomes frames
async fn handle_connection(
    conn: ConnectionId,
    stream: TcpStream,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<ServerEvent>,
    ping_interval: Duration,
    outbox_capacity: usize,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let (outbox_tx, mut outbox_rx) = mpsc::channel(outbox_capacity.max(1));

    if events
        .send(ServerEvent::Connected {
            conn,
            addr,
            outbox: outbox_tx,
        })
        .is_err()
    {
        return;
    }

    let mut ping = interval(ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = outbox_rx.recv() => {
                match frame {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            debug!("Send to connection {} failed: {}", conn, e);
                            break;
                        }
                    }
                    Some(Outbound::Close(reason)) => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: reason.into(),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            debug!("Close of connection {} failed: {}", conn, e);
                        }
                        break;
                    }
                    None => break,
                }
            },

            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let event = match ClientMessage::from_json(text.as_str()) {
                            Ok(message) => ServerEvent::Message { conn, message },
                            Err(e) => ServerEvent::Malformed { conn, reason: e.to_string() },
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let event = ServerEvent::Malformed {
                            conn,
                            reason: "binary frames are not supported".to_string(),
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket error on connection {}: {}", conn, e);
                        break;
                    }
                }
            },

            _ = ping.tick() => {
                if write.send(Message::Ping(Default::default())).await.is_err() {
                    debug!("Ping to connection {} failed", conn);
                    break;
                }
            },
        }
    }

    let _ = events.send(ServerEvent::Disconnected { conn });
}
