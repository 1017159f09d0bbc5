//! Full-stack backend tests over TCP
//!
//! The synchronous backend adapter talks to the real dispatcher through a
//! loopback TCP socket, mock proxy behind it. These tests run without an
//! ambient runtime: the adapter brings its own, the server side gets one of
//! the test's making.

use client::{ClientConfig, ProxyContext, Transfer, TransferStatus, TransferToken, UsbBackend};
use common::test_utils::{mock_descriptor, mock_summary, MockProxy};
use common::{ProxyAddr, ProxyListener, UsbProxy};
use protocol::DeviceId;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

fn three_device_mock() -> Arc<MockProxy> {
    Arc::new(MockProxy::with_devices(vec![
        (mock_summary(42, 1, 2, 3), mock_descriptor(0x1d6b, 0x0001)),
        (mock_summary(43, 1, 2, 4), mock_descriptor(0x1d6b, 0x0002)),
        (mock_summary(44, 2, 1, 1), mock_descriptor(0x1d6b, 0x0003)),
    ]))
}

/// Spawn a server runtime accepting loopback connections for `mock`,
/// returning the runtime handle and the bound port.
fn spawn_server(mock: Arc<MockProxy>) -> (tokio::runtime::Runtime, u16) {
    let runtime = tokio::runtime::Runtime::new().expect("failed to build server runtime");

    let listener = runtime.block_on(async {
        ProxyListener::bind(&ProxyAddr::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
        })
        .await
        .expect("failed to bind loopback listener")
    });
    let port = match &listener {
        ProxyListener::Tcp(l) => l.local_addr().unwrap().port(),
        #[cfg(unix)]
        _ => unreachable!("bound a tcp address"),
    };

    runtime.spawn(async move {
        loop {
            let Ok(stream) = listener.accept().await else {
                break;
            };
            let proxy: Arc<dyn UsbProxy> = mock.clone();
            tokio::spawn(async move {
                let _ = server::serve(stream, proxy).await;
            });
        }
    });

    (runtime, port)
}

fn connect_adapter(port: u16) -> (ProxyContext, Receiver<TransferToken>) {
    let config = ClientConfig::from_parts(
        Some(format!("tcp://127.0.0.1:{port}")),
        None,
        None,
    )
    .unwrap();
    let (sink, completions) = std::sync::mpsc::channel();
    let context = ProxyContext::connect(&config, sink).expect("failed to connect adapter");
    (context, completions)
}

#[test]
fn test_full_stack_over_tcp() {
    let mock = three_device_mock();
    let (server_runtime, port) = spawn_server(mock.clone());
    let (context, completions) = connect_adapter(port);

    let caps = context.capabilities();
    assert!(caps.has_hid_access);

    let devices = context.get_device_list().unwrap();
    let ids: Vec<u32> = devices.iter().map(|d| d.id.0).collect();
    assert_eq!(ids, vec![42, 43, 44]);

    context.open(DeviceId(42)).unwrap();
    context.claim_interface(DeviceId(42), 0).unwrap();

    let mut transfer =
        Transfer::bulk_out(DeviceId(42), 0x02, vec![0xde, 0xad, 0xbe, 0xef], 1000);
    context.submit_transfer(&mut transfer).unwrap();

    let token = completions
        .recv_timeout(Duration::from_secs(5))
        .expect("no completion arrived");
    assert_eq!(Some(token), transfer.token());
    context.handle_transfer_completion(&mut transfer);

    assert_eq!(transfer.status, TransferStatus::Completed);
    assert_eq!(transfer.transferred, 4);

    context.close(DeviceId(42));
    assert_eq!(mock.open_count(DeviceId(42)), 0);

    drop(context);
    server_runtime.shutdown_background();
}

#[test]
fn test_connection_loss_mid_transfer_reports_error() {
    let mock = three_device_mock();
    let (server_runtime, port) = spawn_server(mock.clone());
    let (context, completions) = connect_adapter(port);

    context.open(DeviceId(42)).unwrap();
    mock.hold_transfers();

    let mut transfer = Transfer::bulk_out(DeviceId(42), 0x02, vec![1, 2, 3, 4], 1000);
    let before = transfer.buffer.clone();
    context.submit_transfer(&mut transfer).unwrap();

    // Kill the server before the transfer can complete.
    std::thread::sleep(Duration::from_millis(100));
    server_runtime.shutdown_background();

    let token = completions
        .recv_timeout(Duration::from_secs(5))
        .expect("no completion arrived after connection loss");
    assert_eq!(Some(token), transfer.token());
    context.handle_transfer_completion(&mut transfer);

    assert_eq!(transfer.status, TransferStatus::Error);
    assert_eq!(transfer.transferred, 0);
    // The caller's buffer was not touched.
    assert_eq!(transfer.buffer, before);
}
