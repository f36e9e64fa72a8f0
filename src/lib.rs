//! PonsWarp 세션 엔진
//!
//! 실시간 미디어 세션 협상과 연결 복원을 담당한다. 중앙 시그널링 릴레이
//! (`server`, `handlers`, `state`)와 그 위에서 동작하는 클라이언트 엔진(`engine`)으로 구성된다.

pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod server;
pub mod state;

pub use config::{Config, EngineConfig};
pub use error::{EngineError, EngineResult, ErrorKind};
