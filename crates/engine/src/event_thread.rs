//! Device event thread.
//!
//! Polls the device for asynchronous events and posts them to the
//! dispatcher. It never touches component state itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use venc_common::{EngineError, EngineResult};
use venc_device::{DeviceAdapter, DeviceEvent};

use crate::dispatch::{DeviceNotice, Dispatcher, Message};

pub struct EventThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EventThread {
    pub fn spawn(
        device: Arc<dyn DeviceAdapter>,
        dispatcher: Arc<Dispatcher>,
        poll: Duration,
    ) -> EngineResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("venc-device-events".into())
            .spawn(move || poll_events(device.as_ref(), &dispatcher, &flag, poll))
            .map_err(|e| {
                EngineError::InsufficientResources(format!("failed to spawn event thread: {e}"))
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the thread to exit and wait for it. Returns within one poll
    /// interval.
    pub fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Device event thread panicked");
            }
        }
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn poll_events(
    device: &dyn DeviceAdapter,
    dispatcher: &Dispatcher,
    stop: &AtomicBool,
    poll: Duration,
) {
    debug!(?poll, "Device event thread started");
    while !stop.load(Ordering::Acquire) {
        match device.next_event(poll) {
            Ok(Some(DeviceEvent::Closed)) => {
                debug!("Device closed");
                break;
            }
            Ok(Some(event)) => {
                let name = event.name();
                let Some(message) = Message::from_device(event) else {
                    continue;
                };
                if dispatcher.post(message).is_err() {
                    debug!(event = name, "Dispatcher closed; dropping device event");
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Device event poll failed");
                let notice = Message::Device(DeviceNotice::HardwareError(e.to_string()));
                let _ = dispatcher.post(notice);
                break;
            }
        }
    }
    info!("Device event thread exiting");
}
