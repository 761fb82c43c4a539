//! QEMU backend core for an OS test-automation runner.
//!
//! The runner drives a system-under-test inside QEMU; this crate is the
//! subsystem that launches and supervises the qemu process, speaks QMP to
//! it, maintains the versioned block-device/snapshot tree, and performs
//! migration-based save/restore. The parent process talks to it through
//! [`DriverBridge`], which spawns the `capstand` child hosting
//! [`QemuDriver`] behind a duplex JSON pipe.
//!
//! ```rust,no_run
//! use capstan::{DriverBridge, SignalFlag};
//! use capstan_core::{Arch, DiskSpec, Nic, RuntimeFlags, VmConfig};
//! use capstan_ipc::Command;
//!
//! # async fn example() -> capstan_core::Result<()> {
//! let mut config = VmConfig::new(Arch::X86_64, "/var/lib/pool/1");
//! config.ram_mb = 2048;
//! config.nics.push(Nic::user("virtio-net"));
//! config.disks.push(DiskSpec::blank("virtio-blk", 10 << 30));
//!
//! let mut signals = SignalFlag::install()?;
//! let mut vm = DriverBridge::start(config, RuntimeFlags::from_env()).await?;
//! let rsp = vm.send(Command::SaveSnapshot { name: "clean".into() }).await?;
//! assert!(rsp.is_ok());
//!
//! // INT/TERM/HUP/ALRM: stop the VM, fail the run, exit non-zero
//! if signals.triggered().is_some() {
//!     std::process::exit(vm.run_until_signal(&mut signals).await);
//! }
//! vm.stop().await?;
//! std::process::exit(vm.exit_code());
//! # }
//! ```

pub mod blockdev;
pub mod bridge;
pub mod cmdline;
pub mod driver;
pub mod qmp;
pub mod snapshot;
pub mod supervisor;
mod switch;

pub use blockdev::{BlockDevModel, Controller, Drive, DrivePath, Overlay, SnapshotRecord};
pub use bridge::{DriverBridge, SignalFlag, TestBackend};
pub use cmdline::VNC_SHARE_POLICY;
pub use driver::QemuDriver;
pub use qmp::{QmpClient, QmpEvent, QmpResponse};
pub use supervisor::Supervisor;

pub use capstan_core::{Error, Result};
