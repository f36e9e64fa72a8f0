//! 에러 분류

use serde::Serialize;
use thiserror::Error;

/// 세션 단위로 애플리케이션에 보고되는 에러 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// 캡처 장치/권한 없음. 자동 재시도하지 않는다.
    MediaUnavailable,
    /// 잘못되었거나 중복된 원격 시그널. 로그만 남기고 무시한다.
    NegotiationRejected,
    /// 하트비트 끊김. 재연결 감독자가 처리하며 호출자에게 직접 노출하지 않는다.
    HeartbeatTimeout,
    /// 재연결 시도 소진
    ReconnectionExhausted,
    /// 시그널링 채널 자체가 끊김
    ChannelUnavailable,
}

impl ErrorKind {
    /// 호출자에게 노출해야 하는 종류인지
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            ErrorKind::MediaUnavailable
                | ErrorKind::ReconnectionExhausted
                | ErrorKind::ChannelUnavailable
        )
    }
}

/// 전송 계층 / 미디어 캡처 에러
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("media constraints rejected: {0}")]
    ConstraintsRejected(String),
    #[error("no capture device available")]
    NoDevice,
    #[error("permission denied")]
    PermissionDenied,
    #[error("description rejected: {0}")]
    DescriptionRejected(String),
    #[error("candidate rejected: {0}")]
    CandidateRejected(String),
    #[error("transport closed")]
    Closed,
}

/// 시그널링 채널 에러
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("signaling channel closed")]
    Closed,
    #[error("failed to connect to relay: {0}")]
    Connect(String),
}

/// 세션 엔진 Facade 에러
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("session already exists: {0}")]
    AlreadyExists(String),
    #[error("not the host of broadcast {0}")]
    NotHost(String),
    #[error("media unavailable: {0}")]
    MediaUnavailable(TransportError),
    #[error("signaling channel unavailable")]
    ChannelUnavailable(#[from] ChannelError),
    #[error("collaborator hook failed: {0}")]
    Hook(#[source] anyhow::Error),
}

impl EngineError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            EngineError::MediaUnavailable(_) => Some(ErrorKind::MediaUnavailable),
            EngineError::ChannelUnavailable(_) => Some(ErrorKind::ChannelUnavailable),
            _ => None,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
