//! SDP Discovery Collaborator
//!
//! Service-record lookup performed before a connection is considered usable.
//! The wire protocol lives behind this interface; the profile only consumes
//! parsed attribute sets.
//!
//! Implementations are constructed with a clone of the service
//! [`EventSender`](crate::domain::models::EventSender) and complete every
//! lookup by posting a device event back into the queue
//! ([`DeviceIdentityComplete`], [`HidRecordComplete`] or [`DiscoveryFailed`]).
//! They never call into the registry synchronously.
//!
//! [`DeviceIdentityComplete`]: crate::domain::models::DeviceEvent::DeviceIdentityComplete
//! [`HidRecordComplete`]: crate::domain::models::DeviceEvent::HidRecordComplete
//! [`DiscoveryFailed`]: crate::domain::models::DeviceEvent::DiscoveryFailed

use crate::domain::models::{DeviceAddress, ProfileError};

/// Client side of the discovery collaborator.
///
/// A connection attempt runs the two lookups in order: the device-class
/// (PnP identity) query first, then the HID service record.
pub trait DiscoveryClient: Send + Sync {
    /// Start the device-class lookup for vendor/product/version attributes.
    fn discover_device_identity(&self, address: &DeviceAddress) -> Result<(), ProfileError>;

    /// Start the HID service-record lookup (report descriptor, country code,
    /// service and provider names).
    fn discover_hid_record(&self, address: &DeviceAddress) -> Result<(), ProfileError>;
}
