//! The HID-Host profile itself: per-device lifecycle machines and the
//! registry/service that owns them.

pub mod machine;
pub mod service;

pub use machine::DeviceMachine;
pub use service::{ConnectionObserver, HidHostService};
