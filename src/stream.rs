//! 类型擦除层
//!
//! 上层（proxy / mux）只看到 `OpaqueStream`，不关心底层是 TLS 还是 WebSocket

use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// 统一的 IO trait
///
/// 只使用 tokio::io traits，yamux 需要的 futures::io 通过 tokio_util::compat 转换
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// 类型擦除的流
pub type OpaqueStream = Pin<Box<dyn Io + 'static>>;

/// 擦除具体类型
pub fn erase<S>(stream: S) -> OpaqueStream
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    Box::pin(stream)
}
