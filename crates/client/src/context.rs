//! The proxy backend context
//!
//! [`ProxyContext`] is the adapter between the synchronous, callback-driven
//! host USB library and the async RPC core. It embeds a small two-worker
//! runtime; synchronous entry points block on their single RPC exchange,
//! while transfer submission spawns a background task and returns
//! immediately. Completed transfers are announced through the host's
//! completion sink and collected by `handle_transfer_completion`.

use crate::backend::{CompletionSink, Status, Transfer, TransferToken, UsbBackend};
use crate::config::ClientConfig;
use crate::device::{sanitize, DiscoveredDevice};
use crate::remote::RemoteProxy;
use crate::transfer::{apply_completion, outbound_buffer, transfer_is_in};
use common::{setup_logging, UsbProxy};
use protocol::usb::{error_code, transfer_status, transfer_type, ENDPOINT_IN};
use protocol::{Capabilities, DeviceId, TransferRequest, TransferResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Results of completed transfers, parked until the host collects them.
struct TransferBoard {
    completed: Mutex<HashMap<TransferToken, TransferResult>>,
    sink: CompletionSink,
}

impl TransferBoard {
    fn complete(&self, token: TransferToken, result: TransferResult) {
        self.completed
            .lock()
            .expect("transfer board poisoned")
            .insert(token, result);
        // The host may already be gone during teardown.
        let _ = self.sink.send(token);
    }

    fn take(&self, token: TransferToken) -> Option<TransferResult> {
        self.completed
            .lock()
            .expect("transfer board poisoned")
            .remove(&token)
    }
}

/// The backend adapter fronting a remote usb-proxy server.
pub struct ProxyContext {
    runtime: Runtime,
    proxy: Arc<dyn UsbProxy>,
    remote: Option<RemoteProxy>,
    driver: Option<JoinHandle<()>>,
    capabilities: Capabilities,
    devices: Mutex<HashMap<DeviceId, DiscoveredDevice>>,
    board: Arc<TransferBoard>,
    next_token: AtomicU64,
}

impl ProxyContext {
    /// Connect to the configured server and probe its capabilities.
    ///
    /// This is the backend's `init`: it resolves the address list, picks the
    /// first reachable server, spawns the endpoint driver and performs the
    /// capability probe. Errors map onto backend status codes.
    pub fn connect(config: &ClientConfig, completions: CompletionSink) -> Result<Self, Status> {
        setup_logging(config.log_filter());

        let runtime = Self::build_runtime()?;
        let (remote, driver) = runtime
            .block_on(RemoteProxy::connect(&config.addresses))
            .map_err(|e| {
                error!("failed to connect to host: {e}");
                error_code::ACCESS
            })?;

        let proxy: Arc<dyn UsbProxy> = Arc::new(remote.clone());
        Self::finish(runtime, proxy, Some(remote), Some(driver), completions)
    }

    /// Build the adapter over an arbitrary proxy implementation.
    ///
    /// Used by tests to run the full backend flow against a mock or an
    /// already-connected remote proxy.
    pub fn with_proxy(
        proxy: Arc<dyn UsbProxy>,
        completions: CompletionSink,
    ) -> Result<Self, Status> {
        let runtime = Self::build_runtime()?;
        Self::finish(runtime, proxy, None, None, completions)
    }

    fn build_runtime() -> Result<Runtime, Status> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("usb-proxy-client")
            .enable_all()
            .build()
            .map_err(|e| {
                error!("failed to start the client runtime: {e}");
                error_code::OTHER
            })
    }

    fn finish(
        runtime: Runtime,
        proxy: Arc<dyn UsbProxy>,
        remote: Option<RemoteProxy>,
        driver: Option<JoinHandle<()>>,
        completions: CompletionSink,
    ) -> Result<Self, Status> {
        let capabilities = runtime
            .block_on(proxy.get_capabilities())
            .map_err(|e| e.code())?;
        info!(
            "server capabilities: hid_access={}, detach_kernel_driver={}",
            capabilities.has_hid_access, capabilities.supports_detach_kernel_driver
        );

        Ok(Self {
            runtime,
            proxy,
            remote,
            driver,
            capabilities,
            devices: Mutex::new(HashMap::new()),
            board: Arc::new(TransferBoard {
                completed: Mutex::new(HashMap::new()),
                sink: completions,
            }),
            next_token: AtomicU64::new(1),
        })
    }

    fn block_on<R>(
        &self,
        fut: impl std::future::Future<Output = common::Result<R>>,
    ) -> Result<R, Status> {
        self.runtime.block_on(fut).map_err(|e| e.code())
    }

    fn copy_descriptor_prefix(blob: &[u8], buf: &mut [u8]) -> usize {
        let len = blob.len().min(buf.len());
        buf[..len].copy_from_slice(&blob[..len]);
        len
    }
}

impl UsbBackend for ProxyContext {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn get_device_list(&self) -> Result<Vec<DiscoveredDevice>, Status> {
        let summaries = self.block_on(self.proxy.devices_list())?;

        let mut list = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let known = self
                .devices
                .lock()
                .expect("device map poisoned")
                .get(&summary.id)
                .cloned();
            if let Some(device) = known {
                list.push(device);
                continue;
            }

            let descriptor = self.block_on(self.proxy.device_descriptor(summary.id))?;
            let device = DiscoveredDevice {
                id: summary.id,
                bus_number: summary.bus_number,
                port_number: summary.port_number,
                device_address: summary.device_address,
                descriptor,
            };
            info!(
                "new device dev_id={:x}, bus={}, port={}, addr={}",
                device.id.0, device.bus_number, device.port_number, device.device_address
            );
            if !sanitize(&device) {
                continue;
            }
            self.devices
                .lock()
                .expect("device map poisoned")
                .insert(device.id, device.clone());
            list.push(device);
        }
        Ok(list)
    }

    fn open(&self, device_id: DeviceId) -> Result<(), Status> {
        debug!("open device id {:x}", device_id.0);
        self.block_on(self.proxy.open_device(device_id))
    }

    fn close(&self, device_id: DeviceId) {
        debug!("close device id {:x}", device_id.0);
        if let Err(e) = self.runtime.block_on(self.proxy.close_device(device_id)) {
            warn!("cannot close device: {e}");
        }
    }

    fn get_active_config_descriptor(
        &self,
        device_id: DeviceId,
        buf: &mut [u8],
    ) -> Result<usize, Status> {
        let blob = self.block_on(self.proxy.active_config_descriptor(device_id))?;
        Ok(Self::copy_descriptor_prefix(&blob, buf))
    }

    fn get_config_descriptor(
        &self,
        device_id: DeviceId,
        index: u8,
        buf: &mut [u8],
    ) -> Result<usize, Status> {
        let blob = self.block_on(self.proxy.config_descriptor(device_id, index))?;
        Ok(Self::copy_descriptor_prefix(&blob, buf))
    }

    fn get_configuration(&self, device_id: DeviceId) -> Result<u8, Status> {
        self.block_on(self.proxy.get_configuration(device_id))
    }

    fn set_configuration(&self, device_id: DeviceId, config: i32) -> Result<(), Status> {
        self.block_on(self.proxy.set_configuration(device_id, config))
    }

    fn claim_interface(&self, device_id: DeviceId, iface: u8) -> Result<(), Status> {
        self.block_on(self.proxy.claim_interface(device_id, iface))
    }

    fn release_interface(&self, device_id: DeviceId, iface: u8) -> Result<(), Status> {
        self.block_on(self.proxy.release_interface(device_id, iface))
    }

    fn set_interface_altsetting(
        &self,
        device_id: DeviceId,
        iface: u8,
        altsetting: u8,
    ) -> Result<(), Status> {
        self.block_on(
            self.proxy
                .set_interface_altsetting(device_id, iface, altsetting),
        )
    }

    fn clear_halt(&self, device_id: DeviceId, endpoint: u8) -> Result<(), Status> {
        self.block_on(self.proxy.clear_halt(device_id, endpoint))
    }

    fn reset_device(&self, device_id: DeviceId) -> Result<(), Status> {
        self.block_on(self.proxy.reset_device(device_id))
    }

    fn kernel_driver_active(&self, device_id: DeviceId, iface: u8) -> Result<bool, Status> {
        self.block_on(self.proxy.kernel_driver_active(device_id, iface))
    }

    fn detach_kernel_driver(&self, device_id: DeviceId, iface: u8) -> Result<(), Status> {
        self.block_on(self.proxy.detach_kernel_driver(device_id, iface))
    }

    fn attach_kernel_driver(&self, device_id: DeviceId, iface: u8) -> Result<(), Status> {
        self.block_on(self.proxy.attach_kernel_driver(device_id, iface))
    }

    fn submit_transfer(&self, transfer: &mut Transfer) -> Result<(), Status> {
        match transfer.kind {
            transfer_type::CONTROL | transfer_type::BULK | transfer_type::INTERRUPT => {}
            _ => {
                error!("transfer type {} not implemented", transfer.kind);
                return Err(error_code::NOT_SUPPORTED);
            }
        }
        if transfer.kind == transfer_type::CONTROL
            && transfer.buffer.len() < protocol::usb::CONTROL_SETUP_SIZE
        {
            return Err(error_code::INVALID_PARAM);
        }

        let is_in = transfer_is_in(transfer);
        let buffer = outbound_buffer(transfer, is_in);
        let token = TransferToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        transfer.token = Some(token);
        transfer.transferred = 0;

        let request = TransferRequest {
            device_id: transfer.device_id,
            timeout_ms: transfer.timeout_ms,
            length: transfer.buffer.len() as u32,
            endpoint: transfer.endpoint | if is_in { ENDPOINT_IN } else { 0 },
            kind: transfer.kind,
            buffer,
        };
        debug!(
            "submit transfer: endp={:#04x} ({}), length={}",
            request.endpoint,
            if is_in { "IN" } else { "OUT" },
            request.length
        );

        let proxy = self.proxy.clone();
        let board = self.board.clone();
        self.runtime.spawn(async move {
            let result = match proxy.submit_transfer(request).await {
                Ok(result) => result,
                Err(e) => {
                    // Includes the connection dropping mid-transfer.
                    error!("transfer failed unexpectedly: {e}");
                    TransferResult {
                        status: transfer_status::ERROR,
                        actual_length: 0,
                        data: Vec::new(),
                    }
                }
            };
            board.complete(token, result);
        });

        Ok(())
    }

    fn cancel_transfer(&self, _transfer: &mut Transfer) -> Result<(), Status> {
        // No wire-level cancel: the server runs the transfer to completion
        // and the result is discarded on arrival.
        Ok(())
    }

    fn handle_transfer_completion(&self, transfer: &mut Transfer) {
        let Some(token) = transfer.token.take() else {
            warn!("transfer completion without a submitted transfer");
            return;
        };
        match self.board.take(token) {
            Some(result) => apply_completion(transfer, result),
            None => {
                warn!("no result recorded for transfer");
                transfer.status = crate::backend::TransferStatus::Error;
            }
        }
    }
}

impl Drop for ProxyContext {
    fn drop(&mut self) {
        if let Some(remote) = self.remote.take() {
            remote.close();
        }
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}
