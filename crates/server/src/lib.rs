//! usb-proxy server internals
//!
//! The server owns the physical USB buses and serves them to remote proxy
//! backends over the framed RPC protocol. Modules:
//!
//! - [`devices`]: the process-wide device table and open reference counting;
//! - [`host`]: the proxy contract implemented against the native library;
//! - [`transfers`]: asynchronous transfer submission with callback bridging;
//! - [`events`]: the dedicated event-pump thread;
//! - [`dispatch`]: per-connection method registration and serving.

pub mod devices;
pub mod dispatch;
pub mod events;
pub mod host;
pub mod transfers;

pub use dispatch::serve;
pub use events::EventPump;
pub use host::HostProxy;
