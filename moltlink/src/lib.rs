//! moltlink: runtime generation of the native stubs that carry calls across
//! the boundary between Molt-managed code and foreign functions.
//!
//! Two kinds of stub are generated, both as position-independent machine code
//! in executable buffers:
//!
//!  * Downcall stubs ([x64::downcall]): called from managed code under the
//!    managed calling convention, they publish a frame anchor, flip the
//!    thread's execution state, shuffle arguments into foreign ABI locations,
//!    call the foreign function, and run the safepoint/reguard protocol on the
//!    way back.
//!
//!  * Upcall stubs ([x64::upcall]): called by foreign code under a foreign
//!    ABI, they preserve the callee-saved registers, attach the thread via the
//!    runtime's entry hook, resolve the receiver handle and dispatch into
//!    managed code.
//!
//! The layout of stub frames is decided up front ([frame]), argument motion is
//! planned as an explicit move list ([shuffle]), and everything the stubs
//! assume about the host runtime is collected in [vm].

#![allow(clippy::new_without_default)]

#[cfg(not(target_arch = "x86_64"))]
compile_error!("moltlink is only implemented for x86_64 targets");

use std::error::Error;
use thiserror::Error;

pub mod abi;
pub mod dis;
pub mod frame;
pub mod log;
pub mod shuffle;
pub mod vm;
pub mod x64;

pub use x64::downcall::{make_downcall_stub, DowncallStub};
pub use x64::upcall::{make_upcall_stub, UpcallStub};

/// Reasons why stub generation can fail.
///
/// Malformed requests (unknown locations, mismatched signature lengths,
/// convention contracts broken by the caller) are programming errors and
/// panic instead.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The stub could not be generated for environmental reasons, e.g. the
    /// executable memory pool is exhausted.
    #[error("Resource exhausted: {0:}")]
    ResourceExhausted(Box<dyn Error>),
    /// Something went wrong that is the fault of this crate.
    #[error("Internal error: {0}")]
    Internal(String),
    /// Anything else.
    #[error("General error: {0}")]
    General(String),
}
