//! USB event pump
//!
//! Dedicated thread driving the native library's event handling. Transfer
//! completion callbacks fire on this thread, so it must keep turning for as
//! long as any connection may have transfers in flight.

use rusb::{Context, UsbContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Handle on the event-pump thread.
pub struct EventPump {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventPump {
    /// Spawn the pump for `context`.
    pub fn spawn(context: Context) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let thread = std::thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || {
                info!("usb event thread started");
                while !flag.load(Ordering::Relaxed) {
                    // The timeout bounds how long shutdown can lag behind the
                    // stop flag.
                    match context.handle_events(Some(Duration::from_millis(100))) {
                        Ok(()) => {}
                        Err(rusb::Error::Interrupted) => {
                            debug!("usb event handling interrupted");
                        }
                        Err(e) => {
                            warn!("error handling usb events: {}", e);
                            std::thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
                info!("usb event thread stopped");
            })
            .expect("failed to spawn usb event thread");

        Self {
            stop,
            thread: Some(thread),
        }
    }

    /// Stop the pump and wait for the thread to exit.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
