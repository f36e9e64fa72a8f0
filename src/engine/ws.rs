//! WebSocket 시그널링 채널 (릴레이 서버 `/ws` 접속)

use crate::engine::channel::SignalingChannel;
use crate::error::ChannelError;
use crate::protocol::{ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WsSignalingChannel {
    participant_id: String,
    outbound: UnboundedSender<ClientMessage>,
    events: Mutex<Option<UnboundedReceiver<ServerMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsSignalingChannel {
    /// `base_url` 예: `ws://127.0.0.1:5502/ws`
    pub async fn connect(base_url: &str, participant_id: &str) -> Result<Arc<Self>, ChannelError> {
        let url = relay_url(base_url, participant_id)?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = socket.split();

        // 첫 메시지는 릴레이가 확정한 참가자 ID
        let assigned_id = tokio::time::timeout(CONNECT_TIMEOUT, async {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if let Ok(ServerMessage::Connected { participant_id }) =
                            serde_json::from_str::<ServerMessage>(&text)
                        {
                            return Some(participant_id);
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => return None,
                    _ => {}
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
        .ok_or_else(|| ChannelError::Connect("relay did not confirm connection".to_string()))?;

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<ServerMessage>();

        // 송신 태스크
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to encode client message"),
                }
            }
            let _ = ws_sender.close().await;
        });

        // 수신 태스크. 끝나면 events_tx 가 드롭되어 채널 끊김이 전파된다.
        let reader_id = assigned_id.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if events_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(participant_id = %reader_id, error = %e, "Malformed relay message")
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        tracing::warn!(participant_id = %reader_id, error = %e, "Signaling websocket error");
                        break;
                    }
                    _ => {}
                }
            }
            tracing::info!(participant_id = %reader_id, "Signaling websocket closed");
        });

        let keepalive_tx = outbound.clone();
        let keepalive = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if keepalive_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        tracing::info!(participant_id = %assigned_id, "Signaling websocket connected");

        Ok(Arc::new(Self {
            participant_id: assigned_id,
            outbound,
            events: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(vec![writer, reader, keepalive]),
        }))
    }
}

/// 릴레이 접속 URL. 참가자 ID 는 쿼리 문자열로 인코딩한다.
fn relay_url(base_url: &str, participant_id: &str) -> Result<Url, ChannelError> {
    let mut url = Url::parse(base_url)
        .map_err(|e| ChannelError::Connect(format!("invalid relay url {}: {}", base_url, e)))?;
    url.query_pairs_mut()
        .append_pair("participant_id", participant_id);
    Ok(url)
}

impl SignalingChannel for WsSignalingChannel {
    fn participant_id(&self) -> &str {
        &self.participant_id
    }

    fn send(&self, message: ClientMessage) -> Result<(), ChannelError> {
        self.outbound.send(message).map_err(|_| ChannelError::Closed)
    }

    fn take_events(&self) -> Option<UnboundedReceiver<ServerMessage>> {
        self.events.lock().ok().and_then(|mut events| events.take())
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}
