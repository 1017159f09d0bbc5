//! usb-proxy client backend
//!
//! A USB backend that, instead of touching kernel USB drivers, forwards
//! every operation to a remote usb-proxy server. The host USB library talks
//! to [`ProxyContext`] through the [`UsbBackend`] contract; the context
//! translates each entry point into one RPC exchange and bridges the
//! server-driven transfer completions back into the host's completion
//! signalling.
//!
//! Configuration comes from the environment (`LIBUSB_PROXY_HOST`,
//! `LIBUSB_PROXY_PORT`, `LIBUSB_PROXY_DEBUG`), see [`ClientConfig`].

pub mod backend;
pub mod config;
pub mod context;
pub mod device;
pub mod remote;
mod transfer;

pub use backend::{CompletionSink, Status, Transfer, TransferStatus, TransferToken, UsbBackend};
pub use config::ClientConfig;
pub use context::ProxyContext;
pub use device::DiscoveredDevice;
pub use remote::RemoteProxy;
