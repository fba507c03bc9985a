/// 隧道服务器主逻辑

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace};

use super::relay::relay_bidirectional;
use crate::config::Config;
use crate::error::Result;
use crate::mux::{PoolSettings, SessionPool};
use crate::transport::yamux::YamuxConnector;
use crate::transport::{Dial, Dialer};

/// 上游连接来源
pub enum Upstream<D: Dial> {
    /// 每个客户端连接单独拨号
    Direct(D),
    /// 从 session 池取多路复用 stream
    Mux(SessionPool<YamuxConnector<D>>),
}

impl<D: Dial> Upstream<D> {
    pub fn new(config: &Config, dialer: D) -> Self {
        if config.use_mux {
            let connector = YamuxConnector::new(Arc::new(dialer));
            Upstream::Mux(SessionPool::new(connector, PoolSettings::from_config(config)))
        } else {
            Upstream::Direct(dialer)
        }
    }
}

/// 运行隧道服务器
pub async fn run_server(config: Config) -> Result<()> {
    let dialer = Dialer::from_config(&config)?;
    let listener = TcpListener::bind(&config.listen_addr).await?;

    info!("🚀 Tunnel listening on {}", config.listen_addr);
    info!("   Remote: {}", config.remote_addr);
    info!("   Transport: {}", dialer.name());
    if config.use_mux {
        info!(
            "   Mux: max {} streams/session, idle timeout {:?}",
            config.mux_max_streams, config.mux_idle_timeout
        );
    }

    serve(listener, Arc::new(Upstream::new(&config, dialer))).await
}

/// accept 循环
///
/// accept 失败视为致命错误，直接返回
pub async fn serve<D: Dial>(listener: TcpListener, upstream: Arc<Upstream<D>>) -> Result<()> {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept error: {}", e);
                return Err(e.into());
            }
        };

        debug!("📥 New connection from {}", addr);
        let upstream = upstream.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &upstream).await {
                error!("Connection error from {}: {}", addr, e);
            }
        });
    }
}

/// 处理单个连接：取上游连接，转发，然后两端各关闭一次
///
/// 只有取上游失败（拨号、握手、取 stream）作为错误返回，此时直接丢弃客户端连接，不重试；
/// 转发和关闭阶段的 IO 错误属于正常断开，只记 debug 日志
async fn handle_connection<D: Dial>(mut client: TcpStream, upstream: &Upstream<D>) -> Result<()> {
    client.set_nodelay(true)?;

    let result = match upstream {
        Upstream::Direct(dialer) => {
            let mut remote = dialer.dial().await?;
            let result = relay_bidirectional(&mut client, &mut remote).await;

            if let Err(e) = remote.shutdown().await {
                trace!("Upstream shutdown error (may be expected): {}", e);
            }
            if let Err(e) = client.shutdown().await {
                trace!("Client shutdown error (may be expected): {}", e);
            }
            result
        }
        Upstream::Mux(pool) => {
            let mut stream = pool.get_stream().await?;
            debug!("Tunnel on session {:?}", stream.session_id());
            let result = relay_bidirectional(&mut client, &mut stream).await;

            if let Err(e) = client.shutdown().await {
                trace!("Client shutdown error (may be expected): {}", e);
            }
            if let Err(e) = stream.close().await {
                debug!("Stream close error: {}", e);
            }
            result
        }
    };

    if let Err(e) = result {
        debug!("Relay ended with error: {}", e);
    }
    Ok(())
}
