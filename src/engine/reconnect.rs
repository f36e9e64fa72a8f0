//! 재연결 감독 정책
//!
//! 실패한 세션을 다시 세울지, 얼마나 기다릴지를 결정한다.

use crate::config::EngineConfig;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// `delay` 후에 `attempt` 번째 시도를 시작
    Retry { attempt: u32, delay: Duration },
    /// 시도 소진
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.reconnect_max_attempts,
            base: config.reconnect_backoff_base,
            cap: config.reconnect_backoff_cap,
        }
    }

    /// 지수 백오프: base * 2^(attempt-1), cap 으로 제한
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// 현재까지 시도 횟수로 다음 행동 결정
    pub fn decide(&self, current_attempt: u32) -> ReconnectDecision {
        if current_attempt >= self.max_attempts {
            return ReconnectDecision::Exhausted {
                attempts: current_attempt,
            };
        }
        let attempt = current_attempt + 1;
        ReconnectDecision::Retry {
            attempt,
            delay: self.backoff(attempt),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|n| policy.backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn attempts_never_exceed_maximum() {
        let policy = ReconnectPolicy::default();
        let mut attempt = 0;
        let mut retries = 0;
        loop {
            match policy.decide(attempt) {
                ReconnectDecision::Retry { attempt: next, delay } => {
                    assert_eq!(next, attempt + 1);
                    assert_eq!(delay, policy.backoff(next));
                    attempt = next;
                    retries += 1;
                }
                ReconnectDecision::Exhausted { attempts } => {
                    assert_eq!(attempts, 5);
                    break;
                }
            }
        }
        assert_eq!(retries, 5);
    }
}
