//! Common utilities for usb-proxy
//!
//! This crate provides the pieces shared between the server and the client
//! backend: the proxy contract and its error type, the address grammar with
//! its socket abstraction, logging setup, and mock implementations used by
//! tests across the workspace.

pub mod addr;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod test_utils;

pub use addr::{
    connect, connect_any, parse_addr, parse_addr_list, AddrError, ProxyAddr, ProxyListener,
    ProxyStream, DEFAULT_ADDRESS, DEFAULT_PORT,
};
pub use error::{ProxyError, Result, HOST_ERROR_PREFIX};
pub use logging::{debug_level_filter, setup_logging};
pub use proxy::UsbProxy;
