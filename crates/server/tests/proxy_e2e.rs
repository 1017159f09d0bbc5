//! End-to-end protocol tests
//!
//! Runs the real dispatcher against the mock proxy on one side of an
//! in-memory duplex stream and the real remote proxy on the other, so every
//! scenario exercises the full wire path: framing, multiplexing, method
//! dispatch and error text round-trips.

use client::RemoteProxy;
use common::test_utils::{mock_config_blob, mock_descriptor, mock_summary, with_timeout, MockProxy};
use common::{ProxyError, UsbProxy};
use protocol::usb::{error_code, transfer_status, transfer_type};
use protocol::{DeviceId, TransferRequest};
use std::sync::Arc;
use tokio::task::JoinHandle;

struct Harness {
    proxy: RemoteProxy,
    mock: Arc<MockProxy>,
    server: JoinHandle<()>,
    _client_driver: JoinHandle<()>,
}

fn three_device_mock() -> Arc<MockProxy> {
    Arc::new(MockProxy::with_devices(vec![
        (mock_summary(42, 1, 2, 3), mock_descriptor(0x1d6b, 0x0001)),
        (mock_summary(43, 1, 2, 4), mock_descriptor(0x1d6b, 0x0002)),
        (mock_summary(44, 2, 1, 1), mock_descriptor(0x1d6b, 0x0003)),
    ]))
}

fn start(mock: Arc<MockProxy>) -> Harness {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);

    let server = {
        let proxy: Arc<dyn UsbProxy> = mock.clone();
        tokio::spawn(async move {
            let _ = server::serve(server_stream, proxy).await;
        })
    };

    let endpoint = Arc::new(rpc::Endpoint::new());
    let client_driver = {
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            let _ = endpoint.run(client_stream).await;
        })
    };

    Harness {
        proxy: RemoteProxy::from_endpoint(endpoint),
        mock,
        server,
        _client_driver: client_driver,
    }
}

#[tokio::test]
async fn test_capability_probe() {
    let h = start(three_device_mock());
    let caps = with_timeout(h.proxy.get_capabilities()).await.unwrap();
    assert!(caps.has_hid_access);
    assert!(caps.supports_detach_kernel_driver);
}

#[tokio::test]
async fn test_enumerate_and_describe() {
    let h = start(three_device_mock());

    let devices = with_timeout(h.proxy.devices_list()).await.unwrap();
    let ids: Vec<u32> = devices.iter().map(|d| d.id.0).collect();
    assert_eq!(ids, vec![42, 43, 44]);
    assert_eq!(
        (devices[2].bus_number, devices[2].port_number, devices[2].device_address),
        (2, 1, 1)
    );

    let descriptor = with_timeout(h.proxy.device_descriptor(DeviceId(43)))
        .await
        .unwrap();
    assert_eq!(descriptor.b_length, 18);
    assert_eq!(descriptor.b_descriptor_type, 1);

    // Repeating the enumeration returns the same set.
    let again = with_timeout(h.proxy.devices_list()).await.unwrap();
    assert_eq!(devices, again);
}

#[tokio::test]
async fn test_config_descriptor_blobs() {
    let h = start(three_device_mock());
    let blob = with_timeout(h.proxy.active_config_descriptor(DeviceId(42)))
        .await
        .unwrap();
    assert_eq!(blob, mock_config_blob());

    let by_index = with_timeout(h.proxy.config_descriptor(DeviceId(42), 0))
        .await
        .unwrap();
    assert_eq!(by_index, blob);
}

#[tokio::test]
async fn test_open_claim_bulk_out() {
    let h = start(three_device_mock());
    let id = DeviceId(42);

    with_timeout(h.proxy.open_device(id)).await.unwrap();
    with_timeout(h.proxy.claim_interface(id, 0)).await.unwrap();

    let result = with_timeout(h.proxy.submit_transfer(TransferRequest {
        device_id: id,
        timeout_ms: 1000,
        length: 4,
        endpoint: 0x02,
        kind: transfer_type::BULK,
        buffer: vec![0xde, 0xad, 0xbe, 0xef],
    }))
    .await
    .unwrap();

    assert_eq!(result.status, transfer_status::COMPLETED);
    assert_eq!(result.actual_length, 4);
    assert_eq!(result.data.len(), result.actual_length as usize);
}

#[tokio::test]
async fn test_control_in_with_setup() {
    let h = start(three_device_mock());
    let id = DeviceId(42);
    with_timeout(h.proxy.open_device(id)).await.unwrap();

    let result = with_timeout(h.proxy.submit_transfer(TransferRequest {
        device_id: id,
        timeout_ms: 1000,
        length: 26,
        endpoint: 0x80,
        kind: transfer_type::CONTROL,
        buffer: vec![0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
    }))
    .await
    .unwrap();

    assert_eq!(result.status, transfer_status::COMPLETED);
    assert_eq!(result.actual_length, 18);
    assert_eq!(result.data.len(), 18);
}

#[tokio::test]
async fn test_double_close() {
    let h = start(three_device_mock());
    let id = DeviceId(42);

    with_timeout(h.proxy.open_device(id)).await.unwrap();
    with_timeout(h.proxy.close_device(id)).await.unwrap();
    // The second close succeeds; the server logs a warning and leaves the
    // open count alone.
    with_timeout(h.proxy.close_device(id)).await.unwrap();
    assert_eq!(h.mock.open_count(id), 0);
}

#[tokio::test]
async fn test_transfer_validation_over_the_wire() {
    let h = start(three_device_mock());
    let id = DeviceId(42);
    with_timeout(h.proxy.open_device(id)).await.unwrap();

    // Bulk OUT with the wrong buffer length
    let err = with_timeout(h.proxy.submit_transfer(TransferRequest {
        device_id: id,
        timeout_ms: 1000,
        length: 4,
        endpoint: 0x02,
        kind: transfer_type::BULK,
        buffer: vec![1, 2],
    }))
    .await
    .unwrap_err();
    assert_eq!(err, ProxyError::Usb(transfer_status::ERROR));

    // Control IN without exactly the setup packet
    let err = with_timeout(h.proxy.submit_transfer(TransferRequest {
        device_id: id,
        timeout_ms: 1000,
        length: 26,
        endpoint: 0x80,
        kind: transfer_type::CONTROL,
        buffer: vec![0u8; 12],
    }))
    .await
    .unwrap_err();
    assert_eq!(err, ProxyError::Usb(transfer_status::ERROR));

    // Isochronous transfers are not supported
    let err = with_timeout(h.proxy.submit_transfer(TransferRequest {
        device_id: id,
        timeout_ms: 1000,
        length: 64,
        endpoint: 0x81,
        kind: transfer_type::ISOCHRONOUS,
        buffer: Vec::new(),
    }))
    .await
    .unwrap_err();
    assert_eq!(err, ProxyError::Usb(error_code::NOT_SUPPORTED));
}

#[tokio::test]
async fn test_requires_open_error_crosses_the_wire() {
    let h = start(three_device_mock());
    let err = with_timeout(h.proxy.claim_interface(DeviceId(42), 0))
        .await
        .unwrap_err();
    assert_eq!(err, ProxyError::Usb(error_code::NO_DEVICE));

    let err = with_timeout(h.proxy.device_descriptor(DeviceId(9999)))
        .await
        .unwrap_err();
    assert_eq!(err, ProxyError::Usb(error_code::NO_DEVICE));
}

#[tokio::test]
async fn test_kernel_driver_and_configuration_flow() {
    let h = start(three_device_mock());
    let id = DeviceId(44);

    with_timeout(h.proxy.open_device(id)).await.unwrap();

    assert!(!with_timeout(h.proxy.kernel_driver_active(id, 0)).await.unwrap());
    with_timeout(h.proxy.attach_kernel_driver(id, 0)).await.unwrap();
    assert!(with_timeout(h.proxy.kernel_driver_active(id, 0)).await.unwrap());
    with_timeout(h.proxy.detach_kernel_driver(id, 0)).await.unwrap();

    assert_eq!(with_timeout(h.proxy.get_configuration(id)).await.unwrap(), 1);
    with_timeout(h.proxy.set_configuration(id, 1)).await.unwrap();

    with_timeout(h.proxy.claim_interface(id, 0)).await.unwrap();
    with_timeout(h.proxy.set_interface_altsetting(id, 0, 0))
        .await
        .unwrap();
    with_timeout(h.proxy.clear_halt(id, 0x81)).await.unwrap();
    with_timeout(h.proxy.reset_device(id)).await.unwrap();
    with_timeout(h.proxy.release_interface(id, 0)).await.unwrap_err();
}

#[tokio::test]
async fn test_connection_loss_mid_transfer() {
    let mock = three_device_mock();
    let h = start(mock.clone());
    let id = DeviceId(42);

    with_timeout(h.proxy.open_device(id)).await.unwrap();
    // From here on transfers never complete on the server.
    mock.hold_transfers();

    let pending = {
        let proxy = h.proxy.clone();
        tokio::spawn(async move {
            proxy
                .submit_transfer(TransferRequest {
                    device_id: id,
                    timeout_ms: 1000,
                    length: 4,
                    endpoint: 0x02,
                    kind: transfer_type::BULK,
                    buffer: vec![1, 2, 3, 4],
                })
                .await
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    h.server.abort();

    let result = with_timeout(pending).await.unwrap();
    assert_eq!(result.unwrap_err(), ProxyError::Closed);
}
