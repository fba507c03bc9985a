//! 地址解析工具

use crate::error::{Error, Result};

/// 解析 "host:port"
///
/// 支持 IPv6 字面量 "[::1]:443"，返回的 host 不带方括号
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("Invalid address (expected host:port): {}", addr)))?;

    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if host.is_empty() || (host.contains(':') && !addr.starts_with('[')) {
        return Err(Error::Config(format!("Invalid address: {}", addr)));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| Error::Config(format!("Invalid port: {}", port)))?;

    Ok((host.to_string(), port))
}
