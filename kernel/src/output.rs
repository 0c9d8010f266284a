//! Ambient logging support for the kernel.
//!
//! `macros` defines the feature-cascaded `trace!`/`debug!`/`info!`/`warn!`/`error!`
//! macros used throughout the kernel; each compiles to a real `serial_println!`
//! call when its `log-*` feature is enabled and to a no-op otherwise.

#[macro_use]
pub mod macros;
