//! Core domain: data model, the HSM engine, and configuration.

pub mod hsm;
pub mod models;
pub mod settings;
