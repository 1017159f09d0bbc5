//! Per-connection method registration
//!
//! Wires a proxy implementation into an RPC endpoint, one registered method
//! per operation of the contract. Domain errors are flattened to their
//! stable wire text; the client parses the code back out on the other side.

use common::{ProxyError, UsbProxy};
use protocol::{DeviceId, TransferRequest};
use rpc::Endpoint;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

fn err_text(err: ProxyError) -> String {
    err.to_string()
}

/// Register every proxy method on `endpoint`.
pub fn register_methods(endpoint: &Endpoint, proxy: Arc<dyn UsbProxy>) {
    let p = proxy.clone();
    endpoint.register_fn("get_capabilities", move |(): ()| {
        let p = p.clone();
        async move { p.get_capabilities().await.map_err(err_text) }
    });

    let p = proxy.clone();
    endpoint.register_fn("devices_list", move |(): ()| {
        let p = p.clone();
        async move { p.devices_list().await.map_err(err_text) }
    });

    let p = proxy.clone();
    endpoint.register_fn("device_descriptor", move |(device_id,): (DeviceId,)| {
        let p = p.clone();
        async move { p.device_descriptor(device_id).await.map_err(err_text) }
    });

    let p = proxy.clone();
    endpoint.register_fn(
        "active_config_descriptor",
        move |(device_id,): (DeviceId,)| {
            let p = p.clone();
            async move {
                p.active_config_descriptor(device_id)
                    .await
                    .map_err(err_text)
            }
        },
    );

    let p = proxy.clone();
    endpoint.register_fn(
        "config_descriptor",
        move |(device_id, config_index): (DeviceId, u8)| {
            let p = p.clone();
            async move {
                p.config_descriptor(device_id, config_index)
                    .await
                    .map_err(err_text)
            }
        },
    );

    let p = proxy.clone();
    endpoint.register_fn("get_configuration", move |(device_id,): (DeviceId,)| {
        let p = p.clone();
        async move { p.get_configuration(device_id).await.map_err(err_text) }
    });

    let p = proxy.clone();
    endpoint.register_fn(
        "set_configuration",
        move |(device_id, config): (DeviceId, i32)| {
            let p = p.clone();
            async move {
                p.set_configuration(device_id, config)
                    .await
                    .map_err(err_text)
            }
        },
    );

    let p = proxy.clone();
    endpoint.register_fn(
        "claim_interface",
        move |(device_id, iface): (DeviceId, u8)| {
            let p = p.clone();
            async move { p.claim_interface(device_id, iface).await.map_err(err_text) }
        },
    );

    let p = proxy.clone();
    endpoint.register_fn(
        "release_interface",
        move |(device_id, iface): (DeviceId, u8)| {
            let p = p.clone();
            async move {
                p.release_interface(device_id, iface)
                    .await
                    .map_err(err_text)
            }
        },
    );

    let p = proxy.clone();
    endpoint.register_fn(
        "set_interface_altsetting",
        move |(device_id, iface, altsetting): (DeviceId, u8, u8)| {
            let p = p.clone();
            async move {
                p.set_interface_altsetting(device_id, iface, altsetting)
                    .await
                    .map_err(err_text)
            }
        },
    );

    let p = proxy.clone();
    endpoint.register_fn("clear_halt", move |(device_id, endpoint): (DeviceId, u8)| {
        let p = p.clone();
        async move { p.clear_halt(device_id, endpoint).await.map_err(err_text) }
    });

    let p = proxy.clone();
    endpoint.register_fn("reset_device", move |(device_id,): (DeviceId,)| {
        let p = p.clone();
        async move { p.reset_device(device_id).await.map_err(err_text) }
    });

    let p = proxy.clone();
    endpoint.register_fn(
        "kernel_driver_active",
        move |(device_id, iface): (DeviceId, u8)| {
            let p = p.clone();
            async move {
                p.kernel_driver_active(device_id, iface)
                    .await
                    .map_err(err_text)
            }
        },
    );

    let p = proxy.clone();
    endpoint.register_fn(
        "detach_kernel_driver",
        move |(device_id, iface): (DeviceId, u8)| {
            let p = p.clone();
            async move {
                p.detach_kernel_driver(device_id, iface)
                    .await
                    .map_err(err_text)
            }
        },
    );

    let p = proxy.clone();
    endpoint.register_fn(
        "attach_kernel_driver",
        move |(device_id, iface): (DeviceId, u8)| {
            let p = p.clone();
            async move {
                p.attach_kernel_driver(device_id, iface)
                    .await
                    .map_err(err_text)
            }
        },
    );

    let p = proxy.clone();
    endpoint.register_fn("open_device", move |(device_id,): (DeviceId,)| {
        let p = p.clone();
        async move { p.open_device(device_id).await.map_err(err_text) }
    });

    let p = proxy.clone();
    endpoint.register_fn("close_device", move |(device_id,): (DeviceId,)| {
        let p = p.clone();
        async move { p.close_device(device_id).await.map_err(err_text) }
    });

    let p = proxy;
    endpoint.register_fn("submit_transfer", move |request: TransferRequest| {
        let p = p.clone();
        async move { p.submit_transfer(request).await.map_err(err_text) }
    });
}

/// Serve one connection: build an endpoint, register the proxy methods and
/// drive it until the peer goes away.
pub async fn serve<S>(stream: S, proxy: Arc<dyn UsbProxy>) -> rpc::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let endpoint = Endpoint::new();
    register_methods(&endpoint, proxy);
    debug!("connection handler started");
    endpoint.run(stream).await
}
