use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{MuxConnection, Session};

/// 每个 session 一个的空闲回收任务
///
/// 每隔 `check_interval` 检查一次：有 stream 时记为最近忙碌；
/// 连续空闲超过 `idle_timeout` 后关闭 session 并退出。session 被其他路径关闭后同样退出。
/// 关闭走 `close_if_idle`，与打开 stream 共用 session 的锁
pub fn spawn_idle_reaper<C: MuxConnection>(
    session: Arc<Session<C>>,
    check_interval: Duration,
    idle_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + check_interval, check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_busy = Instant::now();

        loop {
            if session.is_closed() {
                debug!("Session {} closed, idle reaper exiting", session.id());
                return;
            }

            let now = ticker.tick().await;
            if session.num_streams() > 0 {
                last_busy = now;
                continue;
            }

            if now.duration_since(last_busy) > idle_timeout {
                match session.close_if_idle().await {
                    Ok(true) => {
                        debug!("Session {} closed, idle timeout", session.id());
                        return;
                    }
                    // 检查期间有新 stream 打开
                    Ok(false) => last_busy = now,
                    Err(e) => {
                        warn!("Failed to close idle session {}: {}", session.id(), e);
                        return;
                    }
                }
            }
        }
    })
}
