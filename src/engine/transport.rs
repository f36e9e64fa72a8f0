//! 하부 전송 계층(WebRTC 피어 연결)과 로컬 미디어 캡처 추상화
//!
//! 상태 머신은 구체적인 WebRTC 구현을 모른다. 전송 계층은 네 가지 동작
//! (로컬 디스크립션 생성, 원격 디스크립션 적용, 후보 추가, 연결 상태 관찰)만
//! 제공하면 된다. 연결 상태와 로컬 후보는 `TransportEvent` 스트림으로 관찰한다.

use crate::error::TransportError;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// 전송 계층 연결 상태 (ICE/DTLS 상당)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// 전송 계층에서 올라오는 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// 로컬에서 수집된 연결 후보
    LocalCandidate(IceCandidate),
    StateChanged(ConnectivityState),
}

/// 원격 피어 하나와의 연결
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// 로컬 디스크립션을 만들고 로컬에 설정한다
    async fn create_local_description(
        &self,
        kind: SdpKind,
    ) -> Result<SessionDescription, TransportError>;

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// 연결 종료. 로컬 미디어는 건드리지 않는다.
    async fn close(&self);
}

/// 새로 만든 전송 객체와 그 이벤트 스트림
pub struct TransportHandle {
    pub transport: Arc<dyn PeerTransport>,
    pub events: UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// 로컬 미디어(수신 전용이면 None)를 송출하는 전송 객체 생성
    async fn create(
        &self,
        media: Option<Arc<dyn LocalMedia>>,
    ) -> Result<TransportHandle, TransportError>;
}

/// 비디오 제약
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// 캡처 제약 프리셋
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub label: &'static str,
    pub video: Option<VideoConstraints>,
    pub audio: bool,
}

impl MediaConstraints {
    /// 우선순위 순서의 폴백 프리셋 목록
    pub fn fallback_presets() -> Vec<MediaConstraints> {
        vec![
            MediaConstraints {
                label: "hd",
                video: Some(VideoConstraints {
                    width: 1280,
                    height: 720,
                    frame_rate: 30,
                }),
                audio: true,
            },
            MediaConstraints {
                label: "sd",
                video: Some(VideoConstraints {
                    width: 640,
                    height: 480,
                    frame_rate: 30,
                }),
                audio: true,
            },
            MediaConstraints {
                label: "low",
                video: Some(VideoConstraints {
                    width: 320,
                    height: 240,
                    frame_rate: 15,
                }),
                audio: true,
            },
            MediaConstraints {
                label: "audio-only",
                video: None,
                audio: true,
            },
        ]
    }
}

/// 캡처된 로컬 미디어 핸들
///
/// 방송에서는 여러 시청자 세션이 하나의 핸들을 읽기 전용으로 공유한다.
pub trait LocalMedia: Send + Sync + Debug {
    fn id(&self) -> &str;
    fn constraints(&self) -> &MediaConstraints;
    /// 장치가 아직 살아있는지 (재연결 시 재사용 여부 판단)
    fn is_live(&self) -> bool;
    fn stop(&self);
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<dyn LocalMedia>, TransportError>;
}

/// 프리셋을 우선순위대로 시도해 로컬 미디어 확보
///
/// 제약 거부는 다음 프리셋으로 넘어가고, 장치 없음/권한 거부는 즉시 실패한다.
pub async fn acquire_with_fallback(
    source: &dyn MediaSource,
    presets: &[MediaConstraints],
) -> Result<Arc<dyn LocalMedia>, TransportError> {
    let mut last_error = TransportError::NoDevice;

    for preset in presets {
        match source.acquire(preset).await {
            Ok(media) => {
                tracing::debug!(preset = preset.label, media_id = %media.id(), "Local media acquired");
                return Ok(media);
            }
            Err(TransportError::ConstraintsRejected(reason)) => {
                tracing::debug!(preset = preset.label, reason = %reason, "Preset rejected, trying next");
                last_error = TransportError::ConstraintsRejected(reason);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error)
}
