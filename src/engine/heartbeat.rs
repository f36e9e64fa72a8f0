//! 하트비트 모니터
//!
//! 전송 계층의 상태 콜백은 조용한 네트워크 단절에서 오지 않을 수 있으므로,
//! 같은 시그널링 채널 위로 주기적인 생존 신호를 주고받아 끊김을 감지한다.
//! 송신과 타임아웃 검사는 같은 주기로 돈다.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

#[derive(Debug)]
pub struct HeartbeatMonitor {
    timeout: Duration,
    ticker: Interval,
    last_received: Instant,
    /// 현재 타임아웃 에피소드에서 이미 발화했는지
    fired: bool,
}

impl HeartbeatMonitor {
    /// `now` 를 마지막 수신 시각으로 간주하고 시작한다
    pub fn start(interval: Duration, timeout: Duration, now: Instant) -> Self {
        let mut ticker = interval_at(now + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            timeout,
            ticker,
            last_received: now,
            fired: false,
        }
    }

    pub async fn tick(&mut self) -> Instant {
        self.ticker.tick().await
    }

    /// 수신 기록. 진행 중이던 타임아웃 에피소드를 끝냈다면 true.
    pub fn record_received(&mut self, at: Instant) -> bool {
        self.last_received = at;
        std::mem::replace(&mut self.fired, false)
    }

    /// 타임아웃이면 에피소드당 정확히 한 번 true
    pub fn check(&mut self, now: Instant) -> bool {
        if self.fired {
            return false;
        }
        if now.saturating_duration_since(self.last_received) >= self.timeout {
            self.fired = true;
            return true;
        }
        false
    }
}

/// 하트비트 페이로드용 타임스탬프 (ms)
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn times_out_after_three_missed_beats() {
        let start = Instant::now();
        let mut monitor =
            HeartbeatMonitor::start(Duration::from_secs(5), Duration::from_secs(15), start);

        let mut fired_at = None;
        for _ in 0..4 {
            let now = monitor.tick().await;
            if monitor.check(now) {
                fired_at = Some(now);
                break;
            }
        }

        assert_eq!(fired_at, Some(start + Duration::from_secs(15)));
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_dead_interval() {
        let start = Instant::now();
        let mut monitor =
            HeartbeatMonitor::start(Duration::from_secs(5), Duration::from_secs(15), start);

        let mut fired = 0;
        for _ in 0..10 {
            let now = monitor.tick().await;
            if monitor.check(now) {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);

        // 수신이 에피소드를 끝내고, 다음 단절에서 다시 한 번 발화한다
        let now = Instant::now();
        assert!(monitor.record_received(now));
        for _ in 0..10 {
            let now = monitor.tick().await;
            if monitor.check(now) {
                fired += 1;
            }
        }
        assert_eq!(fired, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn received_beats_keep_session_alive() {
        let start = Instant::now();
        let mut monitor =
            HeartbeatMonitor::start(Duration::from_secs(5), Duration::from_secs(15), start);

        for _ in 0..12 {
            let now = monitor.tick().await;
            assert!(!monitor.record_received(now));
            assert!(!monitor.check(now));
        }
        assert_eq!(Instant::now(), start + Duration::from_secs(60));
    }
}
