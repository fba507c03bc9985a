/// 隧道模块：监听、选择上游、双向转发

pub mod relay;
pub mod server;

pub use server::run_server;
