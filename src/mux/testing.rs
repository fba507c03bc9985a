//! 内存中的假多路复用连接，用于 session / pool 测试

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{Connector, MuxConnection, StreamGuard};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub streams: Arc<AtomicUsize>,
    pub closed: AtomicBool,
    pub fail_open: AtomicBool,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
}

impl FakeState {
    pub fn num_streams(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeConn {
    pub state: Arc<FakeState>,
}

impl FakeConn {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FakeState::default()),
        }
    }
}

/// 读立即 EOF，写全部丢弃
pub(crate) struct FakeStream {
    _guard: StreamGuard,
}

impl AsyncRead for FakeStream {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for FakeStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MuxConnection for FakeConn {
    type Stream = FakeStream;

    fn num_streams(&self) -> usize {
        self.state.num_streams()
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    async fn open_stream(&self) -> Result<FakeStream> {
        // 模拟网络往返，让并发的 open 有机会交错
        tokio::task::yield_now().await;

        if self.state.is_closed() {
            return Err(Error::SessionClosed);
        }
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(Error::Yamux(yamux::ConnectionError::Closed));
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(FakeStream {
            _guard: StreamGuard::new(&self.state.streams),
        })
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 记录每次拨号产生的连接状态
#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    conns: Arc<Mutex<Vec<Arc<FakeState>>>>,
    pub fail_dial: Arc<AtomicBool>,
    pub fail_new_open: Arc<AtomicBool>,
}

impl FakeConnector {
    pub fn dials(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    pub fn state(&self, index: usize) -> Arc<FakeState> {
        self.conns.lock().unwrap()[index].clone()
    }
}

impl Connector for FakeConnector {
    type Conn = FakeConn;

    async fn connect(&self) -> Result<FakeConn> {
        if self.fail_dial.load(Ordering::SeqCst) {
            return Err(Error::Io(io::ErrorKind::ConnectionRefused.into()));
        }
        let conn = FakeConn::new();
        conn.state
            .fail_open
            .store(self.fail_new_open.load(Ordering::SeqCst), Ordering::SeqCst);
        self.conns.lock().unwrap().push(conn.state.clone());
        Ok(conn)
    }
}
