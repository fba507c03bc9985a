use std::time::Duration;

use crate::error::{Error, Result};
use crate::utils::split_host_port;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:1080";
pub const DEFAULT_WS_PATH: &str = "/";
pub const DEFAULT_MUX_MAX_STREAMS: usize = 4;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MUX_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MUX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// yamux 单连接允许的最大 stream 数，`mux_max_streams` 不能超过它
pub const MAX_MUX_STREAMS: usize = 256;

/// 全局配置
#[derive(Debug, Clone)]
pub struct Config {
    /// 本地监听地址
    pub listen_addr: String,

    /// 远端地址（host:port）
    pub remote_addr: String,

    /// TLS SNI，未设置时使用远端地址的 host
    pub server_name: Option<String>,

    /// 跳过证书校验
    pub insecure_skip_verify: bool,

    /// 是否使用 WebSocket 包装
    pub use_websocket: bool,

    /// WebSocket 路径
    pub ws_path: String,

    /// 是否启用多路复用
    pub use_mux: bool,

    /// 单个 session 上的最大 stream 数
    pub mux_max_streams: usize,

    /// 拨号 + 握手超时
    pub handshake_timeout: Duration,

    /// 空闲检查间隔
    pub mux_idle_check_interval: Duration,

    /// session 空闲多久后关闭
    pub mux_idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            remote_addr: String::new(),
            server_name: None,
            insecure_skip_verify: false,
            use_websocket: false,
            ws_path: DEFAULT_WS_PATH.to_string(),
            use_mux: false,
            mux_max_streams: DEFAULT_MUX_MAX_STREAMS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            mux_idle_check_interval: DEFAULT_MUX_IDLE_CHECK_INTERVAL,
            mux_idle_timeout: DEFAULT_MUX_IDLE_TIMEOUT,
        }
    }
}

impl Config {
    /// 校验配置，启动前调用一次
    pub fn validate(&self) -> Result<()> {
        if self.remote_addr.is_empty() {
            return Err(Error::Config("remote address is required".into()));
        }
        split_host_port(&self.remote_addr)?;

        if let Some(name) = &self.server_name {
            if name.is_empty() {
                return Err(Error::Config("server name must not be empty".into()));
            }
        }
        if self.use_websocket && !self.ws_path.starts_with('/') {
            return Err(Error::Config(format!(
                "WebSocket path must start with '/': {}",
                self.ws_path
            )));
        }
        if self.mux_max_streams == 0 || self.mux_max_streams > MAX_MUX_STREAMS {
            return Err(Error::Config(format!(
                "mux max streams must be between 1 and {}: {}",
                MAX_MUX_STREAMS, self.mux_max_streams
            )));
        }
        if self.handshake_timeout.is_zero() {
            return Err(Error::Config("handshake timeout must be positive".into()));
        }
        if self.mux_idle_check_interval.is_zero() || self.mux_idle_timeout.is_zero() {
            return Err(Error::Config("mux idle check interval and timeout must be positive".into()));
        }
        Ok(())
    }

    /// 实际使用的 TLS server name
    pub fn server_name(&self) -> Result<String> {
        match &self.server_name {
            Some(name) => Ok(name.clone()),
            None => split_host_port(&self.remote_addr).map(|(host, _)| host),
        }
    }

    /// wss://<server_name><path>
    pub fn ws_url(&self) -> Result<url::Url> {
        let raw = format!("wss://{}{}", self.server_name()?, self.ws_path);
        url::Url::parse(&raw).map_err(|e| Error::Config(format!("Invalid WebSocket URL {}: {}", raw, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(remote: &str) -> Config {
        Config {
            remote_addr: remote.to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_server_name_defaults_to_remote_host() {
        let cfg = config("example.com:443");
        assert_eq!(cfg.server_name().unwrap(), "example.com");

        let cfg = Config {
            server_name: Some("cdn.example.org".into()),
            ..config("1.2.3.4:443")
        };
        assert_eq!(cfg.server_name().unwrap(), "cdn.example.org");
    }

    #[test]
    fn test_ws_url() {
        let cfg = Config {
            use_websocket: true,
            ws_path: "/tunnel".into(),
            ..config("example.com:8443")
        };
        assert_eq!(cfg.ws_url().unwrap().as_str(), "wss://example.com/tunnel");
    }

    #[test]
    fn test_validate() {
        assert!(config("example.com:443").validate().is_ok());
        assert!(config("").validate().is_err());
        assert!(config("example.com").validate().is_err());

        let bad_path = Config {
            use_websocket: true,
            ws_path: "tunnel".into(),
            ..config("example.com:443")
        };
        assert!(bad_path.validate().is_err());

        let zero_streams = Config {
            mux_max_streams: 0,
            ..config("example.com:443")
        };
        assert!(zero_streams.validate().is_err());

        let at_cap = Config {
            mux_max_streams: MAX_MUX_STREAMS,
            ..config("example.com:443")
        };
        assert!(at_cap.validate().is_ok());

        let over_cap = Config {
            mux_max_streams: MAX_MUX_STREAMS + 1,
            ..config("example.com:443")
        };
        assert!(matches!(over_cap.validate(), Err(Error::Config(_))));

        let zero_idle = Config {
            mux_idle_timeout: Duration::ZERO,
            ..config("example.com:443")
        };
        assert!(zero_idle.validate().is_err());
    }
}
