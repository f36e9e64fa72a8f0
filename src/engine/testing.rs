//! 테스트용 가짜 전송 계층 / 미디어 소스와 피어 구성 도우미

use crate::config::{Config, EngineConfig};
use crate::engine::channel::{MemoryChannel, SignalingChannel};
use crate::engine::client::SessionClient;
use crate::engine::events::SessionEvent;
use crate::engine::hooks::Collaborators;
use crate::engine::session::{SessionHandle, SessionState};
use crate::engine::transport::{
    ConnectivityState, LocalMedia, MediaConstraints, MediaSource, PeerTransport, TransportEvent,
    TransportFactory, TransportHandle,
};
use crate::error::TransportError;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use crate::state::AppState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

// ---- loopback transport ----

struct Endpoint {
    owner: String,
    created_at: Instant,
    events: UnboundedSender<TransportEvent>,
    has_local: bool,
    remote_peer: Option<u64>,
    connected: bool,
    closed: bool,
}

/// 같은 네트워크의 두 전송 객체가 서로의 디스크립션을 적용하면 연결된다
#[derive(Default)]
pub(crate) struct LoopbackNetwork {
    endpoints: Mutex<HashMap<u64, Endpoint>>,
    next_id: AtomicUsize,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>, owner: &str) -> Arc<LoopbackFactory> {
        Arc::new(LoopbackFactory {
            network: self.clone(),
            owner: owner.to_string(),
        })
    }

    /// owner 가 만든 전송 객체 수
    pub fn created_by(&self, owner: &str) -> usize {
        let endpoints = self.endpoints.lock().unwrap();
        endpoints.values().filter(|e| e.owner == owner).count()
    }

    /// owner 가 전송 객체를 만든 시각 (생성 순)
    pub fn created_times(&self, owner: &str) -> Vec<Instant> {
        let endpoints = self.endpoints.lock().unwrap();
        let mut created: Vec<(u64, Instant)> = endpoints
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(id, e)| (*id, e.created_at))
            .collect();
        created.sort_by_key(|(id, _)| *id);
        created.into_iter().map(|(_, at)| at).collect()
    }

    pub fn open_by(&self, owner: &str) -> usize {
        let endpoints = self.endpoints.lock().unwrap();
        endpoints
            .values()
            .filter(|e| e.owner == owner && !e.closed)
            .count()
    }

    /// owner 의 연결된 전송 객체에 실패 신호를 보낸다
    pub fn fail(&self, owner: &str) {
        let endpoints = self.endpoints.lock().unwrap();
        for endpoint in endpoints.values() {
            if endpoint.owner == owner && endpoint.connected && !endpoint.closed {
                let _ = endpoint
                    .events
                    .send(TransportEvent::StateChanged(ConnectivityState::Failed));
            }
        }
    }

    fn link(&self, id: u64) {
        let mut endpoints = self.endpoints.lock().unwrap();
        let Some(peer_id) = endpoints.get(&id).and_then(|e| e.remote_peer) else {
            return;
        };
        let ready = |e: Option<&Endpoint>, other: u64| {
            e.map(|e| e.has_local && !e.closed && !e.connected && e.remote_peer == Some(other))
                .unwrap_or(false)
        };
        if !ready(endpoints.get(&id), peer_id) || !ready(endpoints.get(&peer_id), id) {
            return;
        }
        for side in [id, peer_id] {
            if let Some(endpoint) = endpoints.get_mut(&side) {
                endpoint.connected = true;
                let _ = endpoint
                    .events
                    .send(TransportEvent::StateChanged(ConnectivityState::Connected));
            }
        }
    }
}

pub(crate) struct LoopbackFactory {
    network: Arc<LoopbackNetwork>,
    owner: String,
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
        _media: Option<Arc<dyn LocalMedia>>,
    ) -> Result<TransportHandle, TransportError> {
        let id = self.network.next_id.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.network.endpoints.lock().unwrap().insert(
            id,
            Endpoint {
                owner: self.owner.clone(),
                created_at: Instant::now(),
                events: events_tx,
                has_local: false,
                remote_peer: None,
                connected: false,
                closed: false,
            },
        );
        Ok(TransportHandle {
            transport: Arc::new(LoopbackTransport {
                id,
                network: self.network.clone(),
            }),
            events: events_rx,
        })
    }
}

struct LoopbackTransport {
    id: u64,
    network: Arc<LoopbackNetwork>,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_local_description(
        &self,
        kind: SdpKind,
    ) -> Result<SessionDescription, TransportError> {
        {
            let mut endpoints = self.network.endpoints.lock().unwrap();
            let endpoint = endpoints.get_mut(&self.id).ok_or(TransportError::Closed)?;
            if endpoint.closed {
                return Err(TransportError::Closed);
            }
            endpoint.has_local = true;
            let _ = endpoint.events.send(TransportEvent::LocalCandidate(IceCandidate::new(
                format!("candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host", self.id, 40000 + self.id),
            )));
        }
        self.network.link(self.id);
        Ok(SessionDescription::new(
            kind,
            format!("v=0\r\no=loopback {} 1 IN IP4 127.0.0.1\r\ns={}\r\n", self.id, kind.as_str()),
        ))
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let peer = description
            .sdp
            .split_whitespace()
            .nth(2)
            .and_then(|id| id.parse::<u64>().ok())
            .ok_or_else(|| TransportError::DescriptionRejected(description.sdp.clone()))?;
        {
            let mut endpoints = self.network.endpoints.lock().unwrap();
            let endpoint = endpoints.get_mut(&self.id).ok_or(TransportError::Closed)?;
            endpoint.remote_peer = Some(peer);
        }
        self.network.link(self.id);
        Ok(())
    }

    async fn add_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) {
        if let Some(endpoint) = self.network.endpoints.lock().unwrap().get_mut(&self.id) {
            endpoint.closed = true;
        }
    }
}

// ---- media ----

#[derive(Debug)]
pub(crate) struct FakeMedia {
    id: String,
    constraints: MediaConstraints,
    live: AtomicBool,
}

impl LocalMedia for FakeMedia {
    fn id(&self) -> &str {
        &self.id
    }

    fn constraints(&self) -> &MediaConstraints {
        &self.constraints
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct FakeMediaSource {
    rejected_presets: Vec<&'static str>,
    no_device: bool,
    delay: Option<Duration>,
    captures: Mutex<Vec<Arc<FakeMedia>>>,
}

impl FakeMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_device() -> Self {
        Self {
            no_device: true,
            ..Self::default()
        }
    }

    pub fn rejecting(presets: &[&'static str]) -> Self {
        Self {
            rejected_presets: presets.to_vec(),
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn acquired(&self) -> usize {
        self.captures.lock().unwrap().len()
    }

    pub fn stopped(&self) -> usize {
        self.captures
            .lock()
            .unwrap()
            .iter()
            .filter(|m| !m.is_live())
            .count()
    }

    pub fn last_label(&self) -> Option<&'static str> {
        self.captures.lock().unwrap().last().map(|m| m.constraints.label)
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<dyn LocalMedia>, TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.no_device {
            return Err(TransportError::NoDevice);
        }
        if self.rejected_presets.contains(&constraints.label) {
            return Err(TransportError::ConstraintsRejected(constraints.label.to_string()));
        }
        let mut captures = self.captures.lock().unwrap();
        let media = Arc::new(FakeMedia {
            id: format!("capture-{}", captures.len() + 1),
            constraints: constraints.clone(),
            live: AtomicBool::new(true),
        });
        captures.push(media.clone());
        Ok(media)
    }
}

// ---- peers ----

pub(crate) struct TestPeer {
    pub client: SessionClient,
    pub events: UnboundedReceiver<SessionEvent>,
    pub channel: Arc<MemoryChannel>,
    pub media: Arc<FakeMediaSource>,
}

pub(crate) fn relay() -> Arc<AppState> {
    Arc::new(AppState::new(Config::default()))
}

pub(crate) async fn peer(relay: &Arc<AppState>, network: &Arc<LoopbackNetwork>, id: &str) -> TestPeer {
    peer_with(relay, network, id, FakeMediaSource::new(), Collaborators::default()).await
}

pub(crate) async fn peer_with(
    relay: &Arc<AppState>,
    network: &Arc<LoopbackNetwork>,
    id: &str,
    media: FakeMediaSource,
    collaborators: Collaborators,
) -> TestPeer {
    let channel = MemoryChannel::connect(relay.clone(), id).await;
    let media = Arc::new(media);
    let (client, events) = SessionClient::new(
        channel.clone() as Arc<dyn SignalingChannel>,
        network.factory(id),
        media.clone(),
        EngineConfig::default(),
        collaborators,
    );
    TestPeer {
        client,
        events,
        channel,
        media,
    }
}

/// 세션이 해당 상태가 될 때까지 대기 (가상 시간 기준 제한)
pub(crate) async fn wait_for_state(handle: &SessionHandle, state: SessionState, limit: Duration) {
    let mut status = handle.subscribe();
    let reached = tokio::time::timeout(limit, async {
        loop {
            if status.borrow_and_update().state == state {
                return;
            }
            if status.changed().await.is_err() {
                assert_eq!(status.borrow().state, state, "session task ended in another state");
                return;
            }
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "session {} did not reach {:?}, now {:?}",
        handle.session_id(),
        state,
        handle.state()
    );
}

/// 조건에 맞는 다음 이벤트
pub(crate) async fn next_event<F>(
    events: &mut UnboundedReceiver<SessionEvent>,
    limit: Duration,
    mut matches: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

/// 지금까지 쌓인 이벤트 전부
pub(crate) fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
