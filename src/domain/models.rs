//! Shared data model for the HID-Host profile.
//!
//! Everything that travels over the service event queue lives here: device
//! addresses, report payloads, the typed events consumed by the serialized
//! worker, and the error taxonomy returned by the public API.

use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;

/// Remote device address ("AA:BB:CC:DD:EE:FF" style).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress(pub String);

impl DeviceAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Externally visible connection state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionStatus {
    /// Connecting or Connected. These are the states that count against the
    /// connection cap and that reject a second `connect` for the same device.
    pub fn is_connected_family(self) -> bool {
        matches!(self, ConnectionStatus::Connecting | ConnectionStatus::Connected)
    }
}

/// HID report type on the control/interrupt channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportType {
    Input,
    Output,
    Feature,
}

/// One HID report payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidReport {
    pub report_type: ReportType,
    pub data: Vec<u8>,
}

/// Parameters of a GET_REPORT control transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetReportParams {
    pub report_type: ReportType,
    pub report_id: u8,
    pub buffer_size: u16,
}

/// HANDSHAKE result codes returned by the remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeCode {
    Successful,
    NotReady,
    InvalidReportId,
    UnsupportedRequest,
    InvalidParameter,
    Unknown,
    Fatal,
}

/// Identity attributes from the device-class (PnP) discovery step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub version: u16,
}

/// Parsed HID service record from discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidSdpRecord {
    pub vendor_id: u16,
    pub product_id: u16,
    pub version: u16,
    pub country_code: u8,
    pub descriptor: Vec<u8>,
    pub service_name: String,
    pub provider_name: String,
}

/// Events addressed to one device's state machine.
///
/// Collaborators never call into the registry directly; every asynchronous
/// outcome (discovery result, channel event, kernel request) arrives as one
/// of these, wrapped in [`ServiceEvent::Device`].
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Start an outbound connection.
    Open,
    /// Tear the connection down.
    Close,
    /// Send the unplug control frame and tear down.
    VirtualCableUnplug,

    // Discovery collaborator outcomes.
    DeviceIdentityComplete(DeviceIdentity),
    HidRecordComplete(HidSdpRecord),
    DiscoveryFailed,

    // Transport bridge outcomes.
    ChannelOpened,
    ChannelOpenFailed,
    ChannelClosed,

    // Report I/O requested through the public API.
    SendData(HidReport),
    GetReport(GetReportParams),
    SetReport(HidReport),

    // Traffic from the remote device.
    ReceiveInterruptData(HidReport),
    ReceiveReportData(HidReport),
    ReceiveHandshake(HandshakeCode),

    // Requests surfaced by the kernel report transport.
    KernelGetReport {
        request_id: u32,
        params: GetReportParams,
    },
    KernelSetReport {
        request_id: u32,
        report: HidReport,
    },
    KernelOutput(HidReport),
}

/// Messages consumed by the profile service's single worker.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Enable,
    Disable,
    /// Connect request; creates the device machine lazily, or re-posts itself
    /// while a previous machine for the same address is still being removed.
    ConnectDevice(DeviceAddress),
    Device(DeviceAddress, DeviceEvent),
    /// Mark the entry as removing and schedule the final deletion.
    RemoveMachine(DeviceAddress),
    /// Second removal phase: drop the entry from the registry.
    FinalizeRemove(DeviceAddress),
}

/// Sender half of the service event queue, handed to every collaborator.
pub type EventSender = mpsc::UnboundedSender<ServiceEvent>;

/// Errors returned synchronously by the profile's public API.
///
/// Transport and kernel failures that happen after a call was accepted are
/// absorbed by the device machine and surfaced through the connection
/// observer, never through these.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("connection rejected: {0}")]
    AdmissionRejected(&'static str),
    #[error("device is not in a valid state for this operation")]
    InvalidDeviceState,
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("kernel report transport unavailable: {0}")]
    ResourceUnavailable(String),
}
