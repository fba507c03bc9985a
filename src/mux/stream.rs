use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, trace};

use super::{MuxConnection, Session};
use crate::error::Result;

/// session 上的一个逻辑 stream
///
/// 关闭时通知所属 session 做一次空闲检查，每个 stream 只触发一次：
/// 显式 `close()` 时同步完成；未关闭就 drop 时在后台任务中完成
pub struct MuxStream<C: MuxConnection> {
    inner: Option<C::Stream>,
    session: Option<Arc<Session<C>>>,
}

impl<C: MuxConnection> MuxStream<C> {
    pub(crate) fn new(inner: C::Stream, session: Arc<Session<C>>) -> Self {
        Self {
            inner: Some(inner),
            session: Some(session),
        }
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.id())
    }

    /// 关闭 stream，然后检查所属 session 是否空闲
    ///
    /// stream 自身的关闭错误被忽略；返回值是空闲检查的结果（session 是否已关闭）
    pub async fn close(mut self) -> Result<bool> {
        if let Some(mut inner) = self.inner.take() {
            if let Err(e) = inner.shutdown().await {
                trace!("Stream shutdown error (may be expected): {}", e);
            }
        }

        match self.session.take() {
            Some(session) => session.close_if_idle().await,
            None => Ok(false),
        }
    }

    fn inner_mut(&mut self) -> io::Result<&mut C::Stream> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl<C: MuxConnection> Drop for MuxStream<C> {
    fn drop(&mut self) {
        // 先释放底层 stream，计数归零后再检查
        drop(self.inner.take());

        if let Some(session) = self.session.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = session.close_if_idle().await {
                        debug!("Idle check for session {} failed: {}", session.id(), e);
                    }
                });
            }
        }
    }
}

impl<C: MuxConnection> AsyncRead for MuxStream<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().inner_mut() {
            Ok(inner) => Pin::new(inner).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl<C: MuxConnection> AsyncWrite for MuxStream<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().inner_mut() {
            Ok(inner) => Pin::new(inner).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner_mut() {
            Ok(inner) => Pin::new(inner).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner_mut() {
            Ok(inner) => Pin::new(inner).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
