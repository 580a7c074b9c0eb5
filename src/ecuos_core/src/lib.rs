//! The API definition of ecuos, a multi-core OSEK/AUTOSAR-style scheduling
//! core.
//!
//! This crate only defines what the kernel and its users agree on: object
//! identifiers, [status codes](kernel::ResultCode), the static configuration
//! ([`kernel::cfg`]), and the callback contracts the kernel invokes
//! ([`kernel::Hooks`], [`kernel::HardwareTimer`]). The kernel itself lives in
//! `ecuos_kernel`.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)

extern crate alloc;

#[macro_use]
pub mod kernel;

/// The prelude module.
pub mod prelude {
    #[doc(no_inline)]
    pub use crate::kernel::prelude::*;
}
