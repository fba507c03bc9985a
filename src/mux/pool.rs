use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, error, info};

use super::{spawn_idle_reaper, Connector, MuxStream, Session};
use crate::config::Config;
use crate::error::{Error, Result};

/// Session 池参数
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// 单个 session 上的最大 stream 数
    pub max_streams: usize,
    pub idle_check_interval: Duration,
    pub idle_timeout: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_streams: config.mux_max_streams,
            idle_check_interval: config.mux_idle_check_interval,
            idle_timeout: config.mux_idle_timeout,
        }
    }
}

/// 多路复用 session 池
///
/// 池中的 session 不保证可用：已关闭或打开 stream 失败的 session 在扫描时才被剔除。
/// 选择策略是首个有空余的 session，不做负载均衡
pub struct SessionPool<C: Connector> {
    connector: C,
    settings: PoolSettings,
    sessions: DashMap<u64, Arc<Session<C::Conn>>>,
    next_id: AtomicU64,
}

impl<C: Connector> SessionPool<C> {
    pub fn new(connector: C, settings: PoolSettings) -> Self {
        Self {
            connector,
            settings,
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// 池中登记的 session 数（可能包含尚未剔除的已关闭 session）
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// 获取一个 stream
    ///
    /// 先在已有 session 中找有空余的；都不行时新建一个 session
    pub async fn get_stream(&self) -> Result<MuxStream<C::Conn>> {
        // 快照，避免跨 await 持有 map 的锁
        let sessions: Vec<_> = self.sessions.iter().map(|entry| entry.value().clone()).collect();

        for session in sessions {
            if session.is_closed() {
                self.sessions.remove(&session.id());
                debug!("Deleted closed session {}", session.id());
                continue;
            }

            if session.num_streams() >= self.settings.max_streams {
                continue;
            }

            match session.open_stream(self.settings.max_streams).await {
                Ok(stream) => {
                    debug!("Opened stream on existing session {}", session.id());
                    return Ok(stream);
                }
                // 检查之后被别的调用占满，换下一个
                Err(Error::TooManyStreams) => continue,
                Err(e) => {
                    self.sessions.remove(&session.id());
                    error!("Deleted broken session {}: open stream: {}", session.id(), e);
                }
            }
        }

        self.open_on_new_session().await
    }

    /// 拨号新 session 并在其上打开第一个 stream
    ///
    /// 先打开 stream 再登记入池，新 session 在拿到第一个 stream 之前不会被别人的空闲检查关掉
    async fn open_on_new_session(&self) -> Result<MuxStream<C::Conn>> {
        let conn = self.connector.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(id, conn);

        let stream = match session.open_stream(self.settings.max_streams).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(close_err) = session.close_if_idle().await {
                    debug!("Failed to close session {}: {}", id, close_err);
                }
                return Err(e);
            }
        };

        self.sessions.insert(id, session.clone());
        spawn_idle_reaper(
            session,
            self.settings.idle_check_interval,
            self.settings.idle_timeout,
        );

        info!("New session {} opened ({} in pool)", id, self.len());
        Ok(stream)
    }
}
