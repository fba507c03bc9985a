use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::{MuxConnection, MuxStream};
use crate::error::{Error, Result};

/// 一个多路复用连接
///
/// `guard` 串行化 `open_stream` 和 `close_if_idle`：读取 stream 计数和随后的
/// 打开 / 关闭决定在同一把锁内完成，不会出现刚打开的 stream 所在 session 被关掉的情况。
/// 锁是每个 session 独立的，不同 session 之间互不影响
pub struct Session<C> {
    id: u64,
    conn: C,
    guard: Mutex<()>,
}

impl<C: MuxConnection> Session<C> {
    pub fn new(id: u64, conn: C) -> Arc<Self> {
        Arc::new(Self {
            id,
            conn,
            guard: Mutex::new(()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn num_streams(&self) -> usize {
        self.conn.num_streams()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// 打开一个新 stream
    ///
    /// 已达到 `max_streams` 时返回 `Error::TooManyStreams`；底层错误原样返回
    pub async fn open_stream(self: &Arc<Self>, max_streams: usize) -> Result<MuxStream<C>> {
        let _guard = self.guard.lock().await;

        if self.conn.num_streams() >= max_streams {
            return Err(Error::TooManyStreams);
        }

        let stream = self.conn.open_stream().await?;
        Ok(MuxStream::new(stream, self.clone()))
    }

    /// 没有存活的 stream 时关闭底层连接
    ///
    /// 返回 true 表示 session 已关闭（包括之前就已关闭），false 表示仍有 stream
    pub async fn close_if_idle(&self) -> Result<bool> {
        let _guard = self.guard.lock().await;

        if self.conn.num_streams() > 0 {
            return Ok(false);
        }

        if !self.conn.is_closed() {
            self.conn.close().await?;
            debug!("Session {} closed, no streams left", self.id);
        }
        Ok(true)
    }
}

impl<C> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish_non_exhaustive()
    }
}
