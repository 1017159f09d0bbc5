//! Remote proxy
//!
//! Implements the proxy contract by translating every call into one RPC
//! exchange with the server. Method keys match the server's registrations
//! one to one.

use async_trait::async_trait;
use common::{connect_any, ProxyAddr, ProxyError, Result, UsbProxy};
use protocol::{
    Capabilities, DeviceDescriptor, DeviceId, DeviceSummary, TransferRequest, TransferResult,
    WireDecode, WireEncode,
};
use rpc::Endpoint;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Client side of the proxy contract, forwarding over an RPC endpoint.
#[derive(Clone)]
pub struct RemoteProxy {
    endpoint: Arc<Endpoint>,
}

impl RemoteProxy {
    /// Wrap an endpoint that is already being driven elsewhere (tests).
    pub fn from_endpoint(endpoint: Arc<Endpoint>) -> Self {
        Self { endpoint }
    }

    /// Connect to the first reachable address and spawn the endpoint driver
    /// on the current runtime.
    pub async fn connect(addresses: &[ProxyAddr]) -> Result<(Self, JoinHandle<()>)> {
        let stream = connect_any(addresses)
            .await
            .map_err(|e| ProxyError::Transport(e.to_string()))?;
        info!("connected to usb-proxy server");

        let endpoint = Arc::new(Endpoint::new());
        let driver = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                if let Err(e) = endpoint.run(stream).await {
                    debug!("endpoint terminated: {e}");
                }
            })
        };

        Ok((Self { endpoint }, driver))
    }

    /// Initiate orderly shutdown of the underlying endpoint.
    pub fn close(&self) {
        self.endpoint.close();
    }

    async fn call<Args, R>(&self, method: &str, args: Args) -> Result<R>
    where
        Args: WireEncode,
        R: WireDecode,
    {
        self.endpoint
            .call(method, args)
            .await
            .map_err(ProxyError::from)
    }
}

#[async_trait]
impl UsbProxy for RemoteProxy {
    async fn get_capabilities(&self) -> Result<Capabilities> {
        self.call("get_capabilities", ()).await
    }

    async fn devices_list(&self) -> Result<Vec<DeviceSummary>> {
        self.call("devices_list", ()).await
    }

    async fn device_descriptor(&self, device_id: DeviceId) -> Result<DeviceDescriptor> {
        self.call("device_descriptor", (device_id,)).await
    }

    async fn active_config_descriptor(&self, device_id: DeviceId) -> Result<Vec<u8>> {
        self.call("active_config_descriptor", (device_id,)).await
    }

    async fn config_descriptor(&self, device_id: DeviceId, config_index: u8) -> Result<Vec<u8>> {
        self.call("config_descriptor", (device_id, config_index))
            .await
    }

    async fn get_configuration(&self, device_id: DeviceId) -> Result<u8> {
        self.call("get_configuration", (device_id,)).await
    }

    async fn set_configuration(&self, device_id: DeviceId, config: i32) -> Result<()> {
        self.call("set_configuration", (device_id, config)).await
    }

    async fn claim_interface(&self, device_id: DeviceId, iface: u8) -> Result<()> {
        self.call("claim_interface", (device_id, iface)).await
    }

    async fn release_interface(&self, device_id: DeviceId, iface: u8) -> Result<()> {
        self.call("release_interface", (device_id, iface)).await
    }

    async fn set_interface_altsetting(
        &self,
        device_id: DeviceId,
        iface: u8,
        altsetting: u8,
    ) -> Result<()> {
        self.call("set_interface_altsetting", (device_id, iface, altsetting))
            .await
    }

    async fn clear_halt(&self, device_id: DeviceId, endpoint: u8) -> Result<()> {
        self.call("clear_halt", (device_id, endpoint)).await
    }

    async fn reset_device(&self, device_id: DeviceId) -> Result<()> {
        self.call("reset_device", (device_id,)).await
    }

    async fn kernel_driver_active(&self, device_id: DeviceId, iface: u8) -> Result<bool> {
        self.call("kernel_driver_active", (device_id, iface)).await
    }

    async fn detach_kernel_driver(&self, device_id: DeviceId, iface: u8) -> Result<()> {
        self.call("detach_kernel_driver", (device_id, iface)).await
    }

    async fn attach_kernel_driver(&self, device_id: DeviceId, iface: u8) -> Result<()> {
        self.call("attach_kernel_driver", (device_id, iface)).await
    }

    async fn open_device(&self, device_id: DeviceId) -> Result<()> {
        self.call("open_device", (device_id,)).await
    }

    async fn close_device(&self, device_id: DeviceId) -> Result<()> {
        self.call("close_device", (device_id,)).await
    }

    async fn submit_transfer(&self, request: TransferRequest) -> Result<TransferResult> {
        self.call("submit_transfer", request).await
    }
}
