//! 多路复用 session 池
//!
//! 少量昂贵的底层连接（session）承载大量轻量的逻辑 stream：
//! - `Session`：一个多路复用连接 + 一把锁，串行化 "检查计数再行动"
//! - `MuxStream`：一个逻辑 stream，关闭时通知所属 session 做空闲检查
//! - `SessionPool`：按需建立 session，扫描时顺带剔除已关闭 / 损坏的 session
//! - 每个 session 一个空闲回收任务，兜底关闭长时间没有 stream 的 session

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

mod pool;
mod reaper;
mod session;
mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use pool::{PoolSettings, SessionPool};
pub use reaper::spawn_idle_reaper;
pub use session::Session;
pub use stream::MuxStream;

/// 底层多路复用连接
pub trait MuxConnection: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// 当前存活的 stream 数
    fn num_streams(&self) -> usize;

    fn is_closed(&self) -> bool;

    fn open_stream(&self) -> impl Future<Output = Result<Self::Stream>> + Send;

    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// 建立新的多路复用连接
pub trait Connector: Send + Sync + 'static {
    type Conn: MuxConnection;

    fn connect(&self) -> impl Future<Output = Result<Self::Conn>> + Send;
}

/// 存活 stream 计数，创建时加一，drop 时减一
#[derive(Debug)]
pub struct StreamGuard(Arc<AtomicUsize>);

impl StreamGuard {
    pub fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
