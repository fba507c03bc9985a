//! 上游拨号
//!
//! 两种方式：直连 TLS，或 TLS 之上再套一层 WebSocket。
//! 用 enum 而不是 trait object 选择实现，`Dial` trait 只作为上层的注入点

use std::future::Future;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::Config;
use crate::error::Result;
use crate::stream::{erase, OpaqueStream};
use crate::transport::tls::{create_tls_config, establish_tls, server_name};
use crate::transport::websocket::{establish_websocket, WebSocketAdapter};

/// 建立一条到远端的加密字节流
pub trait Dial: Send + Sync + 'static {
    fn dial(&self) -> impl Future<Output = Result<OpaqueStream>> + Send;
}

/// 上游拨号器
pub enum Dialer {
    /// TCP → TLS
    Tls(TlsDialer),
    /// TCP → TLS → WebSocket
    WebSocket(WebSocketDialer),
}

impl Dialer {
    pub fn from_config(config: &Config) -> Result<Self> {
        let tls = TlsDialer {
            remote_addr: config.remote_addr.clone(),
            server_name: server_name(&config.server_name()?)?,
            connector: TlsConnector::from(create_tls_config(config.insecure_skip_verify)),
            timeout: config.handshake_timeout,
        };

        if config.use_websocket {
            Ok(Dialer::WebSocket(WebSocketDialer {
                tls,
                url: config.ws_url()?,
            }))
        } else {
            Ok(Dialer::Tls(tls))
        }
    }

    /// 返回传输层名称
    pub fn name(&self) -> &'static str {
        match self {
            Dialer::Tls(_) => "tls",
            Dialer::WebSocket(_) => "websocket",
        }
    }

    fn handshake_timeout(&self) -> Duration {
        match self {
            Dialer::Tls(d) => d.timeout,
            Dialer::WebSocket(d) => d.tls.timeout,
        }
    }
}

impl Dial for Dialer {
    async fn dial(&self) -> Result<OpaqueStream> {
        // 整个握手过程（TCP + TLS + WebSocket）共用一个超时
        timeout(self.handshake_timeout(), async {
            match self {
                Dialer::Tls(d) => d.connect().await.map(erase),
                Dialer::WebSocket(d) => d.connect().await.map(erase),
            }
        })
        .await?
    }
}

pub struct TlsDialer {
    remote_addr: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    timeout: Duration,
}

impl TlsDialer {
    async fn connect(&self) -> Result<TlsStream<TcpStream>> {
        debug!("Dialing {}", self.remote_addr);
        let tcp = TcpStream::connect(&self.remote_addr).await?;
        tcp.set_nodelay(true)?;
        establish_tls(&self.connector, tcp, self.server_name.clone()).await
    }
}

pub struct WebSocketDialer {
    tls: TlsDialer,
    url: url::Url,
}

impl WebSocketDialer {
    async fn connect(&self) -> Result<WebSocketAdapter<TlsStream<TcpStream>>> {
        let tls = self.tls.connect().await?;
        establish_websocket(tls, &self.url).await
    }
}
