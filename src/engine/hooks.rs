//! 외부 협력자 훅 (방송 기록 등록, 입장 권한)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// 방송 시작 시 전달하는 메타데이터
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMetadata {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// 방송 기록 API
#[async_trait]
pub trait BroadcastRegistry: Send + Sync {
    /// 방송 시작 등록. 반환된 기록 ID 가 세션 ID 로 쓰인다.
    async fn register_start(
        &self,
        host_id: &str,
        metadata: &BroadcastMetadata,
    ) -> anyhow::Result<String>;

    async fn register_end(&self, session_id: &str, recording: Option<String>)
        -> anyhow::Result<()>;
}

/// 세션 입장 권한 확인
#[async_trait]
pub trait JoinAuthorizer: Send + Sync {
    async fn authorize(&self, participant_id: &str, session_id: &str) -> bool;
}

/// 외부 API 없이 로컬에서 ID 를 발급하는 기본 구현
#[derive(Debug, Default)]
pub struct LocalRegistry;

#[async_trait]
impl BroadcastRegistry for LocalRegistry {
    async fn register_start(
        &self,
        host_id: &str,
        metadata: &BroadcastMetadata,
    ) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        tracing::debug!(host_id = %host_id, title = %metadata.title, session_id = %id, "Broadcast registered locally");
        Ok(id)
    }

    async fn register_end(
        &self,
        session_id: &str,
        recording: Option<String>,
    ) -> anyhow::Result<()> {
        tracing::debug!(session_id = %session_id, recording = ?recording, "Broadcast end registered locally");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl JoinAuthorizer for AllowAll {
    async fn authorize(&self, _participant_id: &str, _session_id: &str) -> bool {
        true
    }
}

/// 엔진이 호출하는 협력자 묶음
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn BroadcastRegistry>,
    pub authorizer: Arc<dyn JoinAuthorizer>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            registry: Arc::new(LocalRegistry),
            authorizer: Arc::new(AllowAll),
        }
    }
}
