pub mod addr;

pub use addr::split_host_port;
