//! WebSocket implementation of the transport contract.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::{CandidateId, Connection, Connector, TransportEvent};

/// Close code reported when the stream ended without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code reported when a close frame carried no status.
const NO_STATUS: u16 = 1005;

#[derive(Debug)]
enum Command {
    Send(String),
    Close(u16),
    Cancel,
}

/// Opens each connection on its own tokio task.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn open(
        &self,
        id: CandidateId,
        endpoint: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn Connection> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(id, endpoint.to_string(), command_rx, events));
        Box::new(WebSocketConnection {
            id,
            endpoint: endpoint.to_string(),
            commands,
        })
    }
}

pub struct WebSocketConnection {
    id: CandidateId,
    endpoint: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl Connection for WebSocketConnection {
    fn id(&self) -> CandidateId {
        self.id
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn send(&self, text: String) -> bool {
        self.commands.send(Command::Send(text)).is_ok()
    }

    fn close(&self, code: u16) {
        let _ = self.commands.send(Command::Close(code));
    }

    fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel);
    }
}

/// Resolves once the handle asks to stop before the socket is open.
/// Sends queued that early have nowhere to go and are dropped.
async fn wait_for_abort(commands: &mut mpsc::UnboundedReceiver<Command>) {
    loop {
        match commands.recv().await {
            Some(Command::Send(text)) => {
                tracing::debug!("WS send before open dropped: {}", text);
            }
            Some(Command::Close(_)) | Some(Command::Cancel) | None => return,
        }
    }
}

async fn run(
    id: CandidateId,
    endpoint: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    tracing::info!("Connecting WebSocket to {} (candidate {})", endpoint, id);

    let connected = tokio::select! {
        res = connect_async(endpoint.as_str()) => res,
        _ = wait_for_abort(&mut commands) => {
            tracing::debug!("Candidate {} cancelled while connecting", id);
            return;
        }
    };

    let stream = match connected {
        Ok((stream, response)) => {
            tracing::info!(
                "WebSocket connected to {} (status={})",
                endpoint,
                response.status()
            );
            stream
        }
        Err(e) => {
            tracing::debug!("WebSocket connect to {} failed: {}", endpoint, e);
            let _ = events.send(TransportEvent::Failed {
                id,
                cause: e.to_string(),
            });
            return;
        }
    };

    if events.send(TransportEvent::Opened { id }).is_err() {
        return;
    }

    let (mut sink, mut source) = stream.split();
    let mut close_status: Option<(u16, String)> = None;

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    let _ = events.send(TransportEvent::Message { id, text });
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sink.send(Message::Pong(data)).await {
                        tracing::warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (u16::from(f.code), f.reason.into_owned()),
                        None => (NO_STATUS, String::new()),
                    };
                    tracing::info!("WebSocket closing: code={} reason={:?}", code, reason);
                    close_status = Some((code, reason.clone()));
                    let _ = events.send(TransportEvent::Closing { id, code, reason });
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) | None => {
                    let (code, reason) =
                        close_status.unwrap_or((ABNORMAL_CLOSURE, String::new()));
                    let _ = events.send(TransportEvent::Closed { id, code, reason });
                    return;
                }
                Some(Err(e)) => {
                    let _ = events.send(TransportEvent::Failed { id, cause: e.to_string() });
                    return;
                }
            },
            cmd = commands.recv() => match cmd {
                Some(Command::Send(text)) => {
                    tracing::debug!("WS send: {}", text);
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                    }
                }
                Some(Command::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "".into(),
                    };
                    if close_status.is_none() {
                        close_status = Some((code, String::new()));
                    }
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        tracing::debug!("Close frame not sent: {}", e);
                    }
                }
                Some(Command::Cancel) | None => {
                    tracing::debug!("Candidate {} cancelled", id);
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_refused_connection_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = WebSocketConnector.open(7, &format!("ws://{}", addr), tx);
        assert_eq!(conn.id(), 7);

        match next_event(&mut rx).await {
            TransportEvent::Failed { id, .. } => assert_eq!(id, 7),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_exchange_and_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let msg = ws.next().await.unwrap().unwrap();
            assert_eq!(msg, Message::Text("hello".to_string()));
            ws.send(Message::Text("world".to_string())).await.unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::from(4001),
                reason: "bye".into(),
            }))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = WebSocketConnector.open(1, &format!("ws://{}", addr), tx);

        assert_eq!(next_event(&mut rx).await, TransportEvent::Opened { id: 1 });
        assert!(conn.send("hello".to_string()));
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Message {
                id: 1,
                text: "world".to_string()
            }
        );
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Closing {
                id: 1,
                code: 4001,
                reason: "bye".to_string()
            }
        );
        match next_event(&mut rx).await {
            TransportEvent::Closed { id, code, .. } => {
                assert_eq!(id, 1);
                assert_eq!(code, 4001);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        server.await.unwrap();
    }
}
