//! WebSocket 传输层
//!
//! 在 TLS 连接之上建立 WebSocket 连接，并适配为字节流

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::WebSocketStream;
use tungstenite::client::IntoClientRequest;
use tungstenite::protocol::Message;
use tracing::debug;

use crate::error::Result;

/// WebSocket 适配器 - 将 WebSocketStream 转换为 AsyncRead/AsyncWrite
///
/// 每次写入发送一个 Binary 消息；读取时未消费完的消息留在缓冲区
pub struct WebSocketAdapter<S> {
    inner: WebSocketStream<S>,
    read_buffer: Vec<u8>,
    read_pos: usize,
    eof: bool,
}

impl<S> WebSocketAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self {
            inner: stream,
            read_buffer: Vec::new(),
            read_pos: 0,
            eof: false,
        }
    }
}

fn ws_error(e: tungstenite::Error) -> io::Error {
    match e {
        tungstenite::Error::Io(e) => e,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, e)
        }
        e => io::Error::new(io::ErrorKind::Other, e),
    }
}

impl<S> AsyncRead for WebSocketAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            // 先消费缓冲数据
            if self.read_pos < self.read_buffer.len() {
                let remaining = &self.read_buffer[self.read_pos..];
                let to_copy = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..to_copy]);
                self.read_pos += to_copy;

                if self.read_pos >= self.read_buffer.len() {
                    self.read_buffer.clear();
                    self.read_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            if self.eof {
                return Poll::Ready(Ok(()));
            }

            match futures::ready!(self.inner.poll_next_unpin(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    // 空消息不能当作 EOF 返回
                    if data.is_empty() {
                        continue;
                    }
                    self.read_buffer = data;
                    self.read_pos = 0;
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.eof = true;
                }
                // Ping/Pong 由 tungstenite 处理，Text/Frame 忽略
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Poll::Ready(Err(ws_error(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WebSocketAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        futures::ready!(self.inner.poll_ready_unpin(cx)).map_err(ws_error)?;
        self.inner
            .start_send_unpin(Message::Binary(buf.to_vec()))
            .map_err(ws_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_flush_unpin(cx).map_err(ws_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match futures::ready!(self.inner.poll_close_unpin(cx)) {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(ws_error(e))),
        }
    }
}

/// 在已有的（TLS）连接上完成 WebSocket 握手
pub async fn establish_websocket<S>(stream: S, url: &url::Url) -> Result<WebSocketAdapter<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Establishing WebSocket connection to {}", url);

    let request = url.as_str().into_client_request()?;
    let (ws_stream, response) = tokio_tungstenite::client_async(request, stream).await?;

    debug!("WebSocket handshake successful, status: {:?}", response.status());
    Ok(WebSocketAdapter::new(ws_stream))
}
