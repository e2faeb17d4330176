//! Network Server
//!
//! TCP server answering consensus RPCs and Join requests from other nodes.
//! Each connection carries a sequence of request/response pairs.

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_message, write_message, ErrorCode, Message};
use crate::error::{Error, Result};
use crate::raft::RaftHandle;

/// Network server for cluster communication
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Node the requests are delivered to
    handle: RaftHandle,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(bind_address: String, handle: RaftHandle) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            bind_address,
            handle,
            shutdown,
        }
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("Network server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handle = self.handle.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, handle).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection
async fn handle_connection(socket: TcpStream, peer_addr: &str, handle: RaftHandle) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);
                let response = respond(&handle, message).await;
                write_message(&mut writer, &response).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Run one request through the node
async fn respond(handle: &RaftHandle, message: Message) -> Message {
    let result = match message {
        Message::RequestVote(request) => handle.request_vote(request).await.map(Message::VoteResponse),
        Message::AppendEntries(request) => handle
            .append_entries(request)
            .await
            .map(Message::AppendEntriesResponse),
        Message::Join { descriptor } => handle
            .join(descriptor)
            .await
            .map(|index| Message::JoinResponse { index }),
        other => {
            return Message::Error {
                code: ErrorCode::UnexpectedMessage,
                message: format!("{} is not a request", other.type_name()),
                leader: None,
            }
        }
    };

    result.unwrap_or_else(|e| Message::from_error(&e))
}
