/// 数据转发模块
///
/// 两个方向并发拷贝，任意一个方向结束（EOF 或错误）整个转发即结束，
/// 另一个方向随之取消。两端的关闭由调用方负责，只做一次

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::Result;

/// 缓冲区大小
const BUFFER_SIZE: usize = 32 * 1024;

/// 双向转发数据
///
/// 返回 (local->remote, remote->local) 两个方向已转发的字节数
pub async fn relay_bidirectional<L, R>(local: &mut L, remote: &mut R) -> Result<(u64, u64)>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let mut bytes_l2r = 0u64;
    let mut bytes_r2l = 0u64;

    let result = tokio::select! {
        r = copy_one_way(&mut local_read, &mut remote_write, &mut bytes_l2r, "local->remote") => r,
        r = copy_one_way(&mut remote_read, &mut local_write, &mut bytes_r2l, "remote->local") => r,
    };

    debug!(
        "Relay finished: {} bytes local->remote, {} bytes remote->local",
        bytes_l2r, bytes_r2l
    );

    result.map(|_| (bytes_l2r, bytes_r2l))
}

/// 单向转发，每次写入后 flush
async fn copy_one_way<R, W>(
    reader: &mut R,
    writer: &mut W,
    total_bytes: &mut u64,
    direction: &str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            trace!("{}: EOF reached", direction);
            return Ok(());
        }

        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        *total_bytes += n as u64;
    }
}
