//! Shared types for the capstan QEMU backend: the error taxonomy, the
//! frozen [`VmConfig`] plus mutable [`RuntimeFlags`], and async fd
//! plumbing used by the process supervisor and console fifos.

pub mod async_fd;
pub mod config;
pub mod error;

pub use async_fd::AsyncOwnedFd;
pub use config::{
    Arch, AudioDevice, DiskSpec, DriveFormat, DriveMedia, Firmware, Nic, NicKind, RuntimeFlags,
    TpmDevice, VmConfig, DEFAULT_REQUEST_INTERVAL_MS, FROZEN_REQUEST_INTERVAL_MS,
};
pub use error::{Error, Result};
