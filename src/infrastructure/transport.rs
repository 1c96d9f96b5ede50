//! Transport Bridge Collaborator
//!
//! Channel establishment beneath the profile (the L2CAP control/interrupt
//! pair). Protocol internals stay behind this interface: the profile hands
//! over typed frames and receives channel lifecycle and inbound traffic as
//! posted service events ([`ChannelOpened`], [`ChannelClosed`],
//! [`ChannelOpenFailed`], `Receive*`).
//!
//! [`ChannelOpened`]: crate::domain::models::DeviceEvent::ChannelOpened
//! [`ChannelClosed`]: crate::domain::models::DeviceEvent::ChannelClosed
//! [`ChannelOpenFailed`]: crate::domain::models::DeviceEvent::ChannelOpenFailed

use crate::domain::models::{DeviceAddress, GetReportParams, HidReport, ProfileError};

/// One frame handed to the bridge for delivery to the remote device.
///
/// Control transactions (get/set/unplug) go out on the control channel,
/// `Data` on the interrupt channel; the bridge owns that mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HidFrame {
    GetReport(GetReportParams),
    SetReport(HidReport),
    Data(HidReport),
    VirtualCableUnplug,
}

/// Channel-establishment layer under the profile.
pub trait ChannelBridge: Send + Sync {
    /// Begin establishing the channel pair. Success or failure arrives later
    /// as a posted `ChannelOpened`/`ChannelOpenFailed` event.
    fn open_channel(&self, address: &DeviceAddress) -> Result<(), ProfileError>;

    /// Request teardown. Completion arrives as a posted `ChannelClosed`.
    fn close_channel(&self, address: &DeviceAddress);

    /// Send one frame to the remote device.
    fn send(&self, address: &DeviceAddress, frame: HidFrame) -> Result<(), ProfileError>;
}
