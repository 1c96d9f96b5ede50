//! Infrastructure Module
//!
//! I/O adapters around the profile core.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  HidHostService                       │
//! │   (registry + serialized worker, src/profile)         │
//! └──────────┬─────────────┬──────────────┬──────────────┘
//!            │             │              │
//!            ▼             ▼              ▼
//!    ┌────────────┐ ┌────────────┐ ┌────────────┐
//!    │ Discovery  │ │ Transport  │ │   Kernel   │
//!    │            │ │  Bridge    │ │  Transport │
//!    │ - identity │ │ - channel  │ │ - uhid-like│
//!    │ - HID      │ │   open/    │ │   device   │
//!    │   record   │ │   close    │ │ - reader   │
//!    │            │ │ - frames   │ │   thread   │
//!    └────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! Every collaborator completes asynchronously by posting events back into
//! the service queue; none of them call into the registry directly.

pub mod discovery;
pub mod kernel;
pub mod logging;
pub mod transport;
