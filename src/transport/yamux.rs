//! Yamux 多路复用
//!
//! `yamux::Connection` 需要持续 poll 才能收发数据，所以每个 session 有一个后台
//! driver 任务独占它；外部通过 mpsc 命令通道请求打开 stream 或关闭连接

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::poll_fn;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, trace, warn};
use yamux::{Config as YamuxConfig, Connection, ConnectionError, Mode};

use crate::config::MAX_MUX_STREAMS;
use crate::error::{Error, Result};
use crate::mux::{Connector, MuxConnection, StreamGuard};
use crate::stream::OpaqueStream;
use crate::transport::Dial;

type YamuxConnection = Connection<Compat<OpaqueStream>>;

/// driver 命令
enum SessionCommand {
    /// 打开新的 stream
    OpenStream(oneshot::Sender<Result<YamuxStream>>),
    /// 关闭连接
    Close(oneshot::Sender<Result<()>>),
}

/// driver 退出原因
enum Exit {
    Close(Option<oneshot::Sender<Result<()>>>),
    Remote(Option<ConnectionError>),
}

/// 创建 Yamux 配置
fn create_yamux_config() -> YamuxConfig {
    let mut config = YamuxConfig::default();

    // 分片发送大小：16KB -> 64KB
    config.set_split_send_size(64 * 1024);
    config.set_max_num_streams(MAX_MUX_STREAMS);

    config
}

/// session 上的一个 yamux stream
///
/// 持有计数 guard，drop 时 session 的 stream 数减一
pub struct YamuxStream {
    inner: Compat<yamux::Stream>,
    _guard: StreamGuard,
}

impl AsyncRead for YamuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for YamuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// 一个 yamux 客户端连接的句柄
pub struct YamuxSession {
    command_tx: mpsc::Sender<SessionCommand>,
    streams: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl YamuxSession {
    /// 在已建立的连接上启动 yamux 客户端
    pub fn client(io: OpaqueStream) -> Self {
        let connection = Connection::new(
            TokioAsyncReadCompatExt::compat(io),
            create_yamux_config(),
            Mode::Client,
        );
        let (command_tx, command_rx) = mpsc::channel(16);
        let streams = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(drive(connection, command_rx, streams.clone(), closed.clone()));

        Self {
            command_tx,
            streams,
            closed,
        }
    }
}

impl MuxConnection for YamuxSession {
    type Stream = YamuxStream;

    fn num_streams(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.command_tx.is_closed()
    }

    async fn open_stream(&self) -> Result<YamuxStream> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }

        let (tx, rx) = oneshot::channel();
        self.command_tx.send(SessionCommand::OpenStream(tx)).await?;
        rx.await?
    }

    async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(SessionCommand::Close(tx)).await.is_err() {
            // driver 已退出
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }
}

/// 后台 driver 任务
///
/// 命令和入站事件在同一个 poll 循环里处理；同一时间最多一个进行中的 open
async fn drive(
    mut connection: YamuxConnection,
    mut command_rx: mpsc::Receiver<SessionCommand>,
    streams: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
) {
    let mut pending_open: Option<oneshot::Sender<Result<YamuxStream>>> = None;

    let exit = poll_fn(|cx| loop {
        if let Some(reply) = pending_open.take() {
            match connection.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    let stream = YamuxStream {
                        inner: FuturesAsyncReadCompatExt::compat(stream),
                        _guard: StreamGuard::new(&streams),
                    };
                    let _ = reply.send(Ok(stream));
                    continue;
                }
                // 连接本身的 stream 上限，与 session 占满同义
                Poll::Ready(Err(ConnectionError::TooManyStreams)) => {
                    let _ = reply.send(Err(Error::TooManyStreams));
                    continue;
                }
                Poll::Ready(Err(e)) => {
                    let _ = reply.send(Err(e.into()));
                    continue;
                }
                Poll::Pending => pending_open = Some(reply),
            }
        }

        if pending_open.is_none() {
            match command_rx.poll_recv(cx) {
                Poll::Ready(Some(SessionCommand::OpenStream(reply))) => {
                    pending_open = Some(reply);
                    continue;
                }
                Poll::Ready(Some(SessionCommand::Close(reply))) => {
                    return Poll::Ready(Exit::Close(Some(reply)));
                }
                // 所有句柄都已 drop
                Poll::Ready(None) => return Poll::Ready(Exit::Close(None)),
                Poll::Pending => {}
            }
        }

        match connection.poll_next_inbound(cx) {
            Poll::Ready(Some(Ok(stream))) => {
                // 客户端不接受服务端发起的 stream
                trace!("Refused inbound stream {}", stream.id());
                drop(stream);
            }
            Poll::Ready(Some(Err(e))) => return Poll::Ready(Exit::Remote(Some(e))),
            Poll::Ready(None) => return Poll::Ready(Exit::Remote(None)),
            Poll::Pending => return Poll::Pending,
        }
    })
    .await;

    closed.store(true, Ordering::SeqCst);
    // 还在等待的 open 收到 SessionClosed
    drop(pending_open);

    match exit {
        Exit::Close(reply) => {
            let result = poll_fn(|cx| connection.poll_close(cx))
                .await
                .map_err(Error::from);
            if let Err(e) = &result {
                debug!("Yamux close error (may be expected): {}", e);
            }
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
        Exit::Remote(Some(e)) => warn!("Yamux connection error: {}", e),
        Exit::Remote(None) => debug!("Yamux connection closed by remote"),
    }
}

/// 拨号并在新连接上启动 yamux 客户端
pub struct YamuxConnector<D> {
    dialer: Arc<D>,
}

impl<D: Dial> YamuxConnector<D> {
    pub fn new(dialer: Arc<D>) -> Self {
        Self { dialer }
    }
}

impl<D: Dial> Connector for YamuxConnector<D> {
    type Conn = YamuxSession;

    async fn connect(&self) -> Result<YamuxSession> {
        let io = self.dialer.dial().await?;
        debug!("Starting yamux session");
        Ok(YamuxSession::client(io))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stream::erase;
    use futures::{AsyncReadExt as _, AsyncWriteExt as _};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// 在 duplex 另一端运行 yamux 服务端，每个 stream 原样回显
    pub(crate) fn spawn_echo_server(io: DuplexStream) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut connection = Connection::new(
                TokioAsyncReadCompatExt::compat(io),
                YamuxConfig::default(),
                Mode::Server,
            );
            while let Some(Ok(stream)) = poll_fn(|cx| connection.poll_next_inbound(cx)).await {
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.split();
                    let _ = futures::io::copy(reader, &mut writer).await;
                    let _ = writer.close().await;
                });
            }
        })
    }

    async fn wait_closed(session: &YamuxSession) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !session.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stream_echo() {
        let (client, server) = duplex(64 * 1024);
        let _server = spawn_echo_server(server);
        let session = YamuxSession::client(erase(client));

        let mut stream = session.open_stream().await.unwrap();
        stream.write_all(b"hello yamux").await.unwrap();
        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello yamux");
    }

    #[tokio::test]
    async fn test_stream_count_follows_drop() {
        let (client, server) = duplex(64 * 1024);
        let _server = spawn_echo_server(server);
        let session = YamuxSession::client(erase(client));

        let a = session.open_stream().await.unwrap();
        let b = session.open_stream().await.unwrap();
        assert_eq!(session.num_streams(), 2);

        drop(a);
        assert_eq!(session.num_streams(), 1);
        drop(b);
        assert_eq!(session.num_streams(), 0);
    }

    #[tokio::test]
    async fn test_open_after_close_fails() {
        let (client, server) = duplex(64 * 1024);
        let _server = spawn_echo_server(server);
        let session = YamuxSession::client(erase(client));

        session.close().await.unwrap();
        assert!(session.is_closed());
        assert!(matches!(session.open_stream().await, Err(Error::SessionClosed)));

        // 重复关闭无副作用
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_close_marks_session_closed() {
        let (client, server) = duplex(64 * 1024);
        let session = YamuxSession::client(erase(client));
        assert!(!session.is_closed());

        drop(server);
        wait_closed(&session).await;
        assert!(session.open_stream().await.is_err());
    }

    /// 每次拨号新建一个 duplex，对端是 yamux 回显服务
    #[derive(Default)]
    struct DuplexDial {
        dials: AtomicUsize,
    }

    impl Dial for DuplexDial {
        async fn dial(&self) -> Result<OpaqueStream> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (client, server) = duplex(64 * 1024);
            let _ = spawn_echo_server(server);
            Ok(erase(client))
        }
    }

    #[tokio::test]
    async fn test_connector_uses_dialer() {
        let dial = Arc::new(DuplexDial::default());
        let connector = YamuxConnector::new(dial.clone());
        let session = connector.connect().await.unwrap();
        assert_eq!(dial.dials.load(Ordering::SeqCst), 1);

        let mut stream = session.open_stream().await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_connection_stream_cap_reports_saturation() {
        let (client, server) = duplex(64 * 1024);
        let _server = spawn_echo_server(server);
        let session = YamuxSession::client(erase(client));

        let mut held = Vec::new();
        for _ in 0..MAX_MUX_STREAMS {
            held.push(session.open_stream().await.unwrap());
        }
        assert!(matches!(session.open_stream().await, Err(Error::TooManyStreams)));
        assert!(!session.is_closed());
        assert_eq!(session.num_streams(), MAX_MUX_STREAMS);
    }

    #[tokio::test]
    async fn test_pool_keeps_session_at_connection_cap() {
        use crate::mux::{PoolSettings, SessionPool};

        let dial = Arc::new(DuplexDial::default());
        let settings = PoolSettings {
            max_streams: MAX_MUX_STREAMS + 44,
            idle_check_interval: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(30),
        };
        let pool = SessionPool::new(YamuxConnector::new(dial.clone()), settings);

        let mut held = Vec::new();
        for _ in 0..=MAX_MUX_STREAMS {
            held.push(pool.get_stream().await.unwrap());
        }

        // 第一个 session 满了但仍在池中，第 257 个 stream 落在新 session 上
        assert_eq!(dial.dials.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len(), 2);
        assert_eq!(held[0].session_id(), Some(1));
        assert_eq!(held[MAX_MUX_STREAMS].session_id(), Some(2));
    }
}
