//! Multiplexed RPC over a byte-stream socket
//!
//! This crate provides the request/response engine both ends of usb-proxy
//! share: a symmetric [`Endpoint`] that multiplexes independent in-flight
//! calls over one stream and runs registered handlers for incoming calls.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! # async fn demo(stream: tokio::net::TcpStream) -> Result<(), rpc::RpcError> {
//! let endpoint = Arc::new(rpc::Endpoint::new());
//! endpoint.register_fn("add", |(a, b): (u32, u32)| async move { Ok::<_, String>(a + b) });
//!
//! let driver = {
//!     let endpoint = endpoint.clone();
//!     tokio::spawn(async move { endpoint.run(stream).await })
//! };
//!
//! let sum: u32 = endpoint.call("add", (1u32, 2u32)).await?;
//! assert_eq!(sum, 3);
//! # drop(driver);
//! # Ok(())
//! # }
//! ```

pub mod endpoint;
pub mod error;

pub use endpoint::Endpoint;
pub use error::{Result, RpcError};
