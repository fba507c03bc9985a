//! Transport 层
//!
//! 负责建立到远端的连接（TLS / TLS + WebSocket），以及其上的 yamux 多路复用

pub mod dialer;
pub mod tls;
pub mod websocket;
pub mod yamux;

pub use dialer::{Dial, Dialer};
