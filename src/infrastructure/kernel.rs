//! Kernel Report Transport
//!
//! Character-device bridge that exposes a connected HID device to the host
//! OS. Each connected device owns exactly one transport instance plus one
//! dedicated blocking reader thread; both are torn down together with the
//! device machine.
//!
//! The reader never calls into the registry. Every inbound kernel request
//! (get-report, set-report, output) is posted as a device event and handled
//! on the serialized worker like any other message.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::domain::models::{
    DeviceAddress, DeviceEvent, DeviceIdentity, EventSender, GetReportParams, HandshakeCode,
    HidReport, ProfileError, ServiceEvent,
};

/// Inbound events surfaced by the kernel character device.
#[derive(Debug, Clone)]
pub enum KernelEvent {
    /// The host opened the device node.
    Open,
    /// The host closed the device node.
    Close,
    /// Output report pushed by the host, to be relayed to the remote device.
    Output(HidReport),
    /// Host-side get-report request; `request_id` must be echoed in the
    /// reply.
    GetReport {
        request_id: u32,
        params: GetReportParams,
    },
    /// Host-side set-report request.
    SetReport {
        request_id: u32,
        report: HidReport,
    },
}

/// Raw character-device protocol. Implementations provide interior
/// synchronization: `next_event` blocks on the device while report writes
/// may happen concurrently from the worker.
///
/// `destroy` must unblock a reader parked in `next_event`; after it,
/// `next_event` returns `Ok(None)`.
pub trait KernelReportTransport: Send + Sync {
    /// Create the kernel device from the discovered report descriptor and
    /// device identity.
    fn create(&self, descriptor: &[u8], identity: &DeviceIdentity) -> io::Result<()>;

    fn start(&self) -> io::Result<()>;

    fn stop(&self) -> io::Result<()>;

    fn open(&self) -> io::Result<()>;

    fn close(&self) -> io::Result<()>;

    /// Deliver a report from the remote device to the host.
    fn output(&self, report: &HidReport) -> io::Result<()>;

    /// Answer a pending get-report request.
    fn feature_reply(&self, request_id: u32, status: HandshakeCode, data: &[u8])
        -> io::Result<()>;

    /// Answer a pending set-report request.
    fn set_report_reply(&self, request_id: u32, status: HandshakeCode) -> io::Result<()>;

    fn destroy(&self) -> io::Result<()>;

    /// Block until the next inbound event. `Ok(None)` means the device is
    /// gone and the reader should stop.
    fn next_event(&self) -> io::Result<Option<KernelEvent>>;
}

/// Builds one transport instance per connecting device.
pub trait KernelTransportFactory: Send + Sync {
    fn create_transport(
        &self,
        address: &DeviceAddress,
    ) -> Arc<dyn KernelReportTransport>;
}

/// One live kernel device: a transport plus its reader thread.
///
/// Created on entering Connected, shut down on leaving it. The reader holds
/// an explicit cancellation flag that is raised on shutdown; the thread is
/// joined before the session is released so no event can outlive the device
/// machine it belongs to.
pub struct KernelSession {
    transport: Arc<dyn KernelReportTransport>,
    cancel: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    address: DeviceAddress,
}

impl KernelSession {
    /// Create, start and open the kernel device, then spawn the reader.
    pub fn open(
        transport: Arc<dyn KernelReportTransport>,
        address: DeviceAddress,
        descriptor: &[u8],
        identity: &DeviceIdentity,
        events: EventSender,
    ) -> Result<Self, ProfileError> {
        let unavailable = |e: io::Error| ProfileError::ResourceUnavailable(e.to_string());
        transport.create(descriptor, identity).map_err(unavailable)?;
        transport.start().map_err(unavailable)?;
        transport.open().map_err(unavailable)?;

        let cancel = Arc::new(AtomicBool::new(false));
        let reader = {
            let transport = Arc::clone(&transport);
            let cancel = Arc::clone(&cancel);
            let address = address.clone();
            std::thread::spawn(move || {
                read_loop(&*transport, &cancel, &address, &events);
            })
        };

        info!(device = %address, "kernel report transport opened");
        Ok(Self {
            transport,
            cancel,
            reader: Some(reader),
            address,
        })
    }

    pub fn output(&self, report: &HidReport) {
        if let Err(e) = self.transport.output(report) {
            warn!(device = %self.address, error = %e, "kernel output write failed");
        }
    }

    pub fn feature_reply(&self, request_id: u32, status: HandshakeCode, data: &[u8]) {
        if let Err(e) = self.transport.feature_reply(request_id, status, data) {
            warn!(device = %self.address, error = %e, "kernel feature reply failed");
        }
    }

    pub fn set_report_reply(&self, request_id: u32, status: HandshakeCode) {
        if let Err(e) = self.transport.set_report_reply(request_id, status) {
            warn!(device = %self.address, error = %e, "kernel set-report reply failed");
        }
    }

    /// Raise the cancellation flag, destroy the device and join the reader.
    pub fn shutdown(mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        let _ = self.transport.close();
        let _ = self.transport.stop();
        // destroy unblocks a reader parked in next_event
        let _ = self.transport.destroy();
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!(device = %self.address, "kernel reader thread panicked");
            }
        }
        info!(device = %self.address, "kernel report transport closed");
    }
}

fn read_loop(
    transport: &dyn KernelReportTransport,
    cancel: &AtomicBool,
    address: &DeviceAddress,
    events: &EventSender,
) {
    loop {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        match transport.next_event() {
            Ok(Some(event)) => {
                let device_event = match event {
                    KernelEvent::Open | KernelEvent::Close => {
                        debug!(device = %address, ?event, "kernel node event");
                        continue;
                    }
                    KernelEvent::Output(report) => DeviceEvent::KernelOutput(report),
                    KernelEvent::GetReport { request_id, params } => {
                        DeviceEvent::KernelGetReport { request_id, params }
                    }
                    KernelEvent::SetReport { request_id, report } => {
                        DeviceEvent::KernelSetReport { request_id, report }
                    }
                };
                let _ = events.send(ServiceEvent::Device(address.clone(), device_event));
            }
            Ok(None) => break,
            Err(e) => {
                if !cancel.load(Ordering::SeqCst) {
                    warn!(device = %address, error = %e, "kernel read failed");
                }
                break;
            }
        }
    }
    debug!(device = %address, "kernel reader stopped");
}
