//! Platform adapters.
//!
//! Only Linux is supported today; platform-specific code lives behind this
//! module boundary so a second backend can be added without touching
//! callers.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::*;
