//! Bluetooth HID-Host profile service.
//!
//! Connects HID peripherals (keyboards, mice, gamepads) over the classic
//! control/interrupt channel pair and bridges their reports into a kernel
//! report transport so the host OS sees an ordinary input device.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     HidHostService                       │
//! │  admission control · observers · synchronous queries     │
//! │        ┌──────────── event queue ────────────┐           │
//! │        ▼        one serialized worker        │           │
//! │  ┌───────────┐  ┌───────────┐  ┌───────────┐ │           │
//! │  │ Device    │  │ Device    │  │ Device    │ │           │
//! │  │ Machine A │  │ Machine B │  │ Machine C │ │           │
//! │  └─────┬─────┘  └─────┬─────┘  └─────┬─────┘ │           │
//! └────────┼──────────────┼──────────────┼───────┘           │
//!          ▼              ▼              ▼       ▲
//!     discovery      channel bridge   kernel ────┘
//!                                     transport   (posted events)
//! ```
//!
//! Every mutating operation flows through one queue, so per-device state
//! only ever changes on the worker. Collaborators are trait objects that
//! complete asynchronously by posting events back into the same queue.

pub mod domain;
pub mod infrastructure;
pub mod profile;

pub use domain::hsm::{Dispatch, HsmError, State, StateMachine, MAX_STATE_DEPTH};
pub use domain::models::{
    ConnectionStatus, DeviceAddress, DeviceEvent, DeviceIdentity, EventSender, GetReportParams,
    HandshakeCode, HidReport, HidSdpRecord, ProfileError, ReportType, ServiceEvent,
};
pub use domain::settings::{Settings, SettingsService};
pub use infrastructure::discovery::DiscoveryClient;
pub use infrastructure::logging::{init_logger, LoggingGuard};
pub use infrastructure::kernel::{KernelReportTransport, KernelTransportFactory};
pub use infrastructure::transport::{ChannelBridge, HidFrame};
pub use profile::{ConnectionObserver, HidHostService};
