use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X86_64,
    Aarch64,
    Ppc64,
}

impl Arch {
    pub fn qemu_binary(&self) -> &'static str {
        match self {
            Arch::X86_64 => "qemu-system-x86_64",
            Arch::Aarch64 => "qemu-system-aarch64",
            Arch::Ppc64 => "qemu-system-ppc64",
        }
    }

    /// Default machine type when the config does not force one.
    pub fn default_machine(&self) -> Option<&'static str> {
        match self {
            Arch::X86_64 => None,
            Arch::Aarch64 => Some("virt"),
            Arch::Ppc64 => Some("pseries"),
        }
    }
}

/// Firmware selection. The split variant carries discovered paths once
/// `start_vm` has scanned the OVMF candidates; `None` means "find one".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Firmware {
    Bios,
    UefiSplit {
        code: Option<PathBuf>,
        vars: Option<PathBuf>,
    },
    UefiSingle { image: PathBuf },
}

impl Firmware {
    pub fn is_uefi(&self) -> bool {
        !matches!(self, Firmware::Bios)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum NicKind {
    User,
    Tap {
        ifname: String,
        #[serde(default)]
        script: Option<PathBuf>,
    },
    Vde {
        sock: PathBuf,
        #[serde(default)]
        port: Option<u16>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nic {
    pub kind: NicKind,
    pub model: String,
    #[serde(default)]
    pub mac: Option<String>,
}

impl Nic {
    pub fn user(model: impl Into<String>) -> Self {
        Nic {
            kind: NicKind::User,
            model: model.into(),
            mac: None,
        }
    }

    /// MAC for the nic at `index`, deterministic in (worker_id, index) when
    /// none was configured.
    pub fn effective_mac(&self, worker_id: u16, index: usize) -> String {
        match &self.mac {
            Some(mac) => mac.clone(),
            None => format!("52:54:00:12:{:02x}:{:02x}", worker_id as u8, index as u8),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpmDevice {
    pub socket: PathBuf,
    /// TPM spec version, e.g. "2.0".
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    /// QEMU audiodev backend, e.g. "pa" or "none".
    pub backend: String,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveMedia {
    Disk,
    Cdrom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveFormat {
    #[default]
    Qcow2,
    Raw,
}

impl DriveFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriveFormat::Qcow2 => "qcow2",
            DriveFormat::Raw => "raw",
        }
    }

    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "qcow2" => Some(DriveFormat::Qcow2),
            "raw" | "img" | "iso" => Some(DriveFormat::Raw),
            _ => None,
        }
    }
}

/// A disk the driver turns into a controller + drive pair at `start_vm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Base image. `None` means a blank image of `size` bytes is created.
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub size: Option<u64>,
    /// Controller model: "virtio-blk", "virtio-scsi-pci", "ahci", "ide", "nvme".
    pub controller: String,
    #[serde(default)]
    pub format: DriveFormat,
    #[serde(default)]
    pub bootindex: Option<u32>,
    #[serde(default)]
    pub serial: Option<String>,
}

impl DiskSpec {
    pub fn blank(controller: impl Into<String>, size: u64) -> Self {
        DiskSpec {
            file: None,
            size: Some(size),
            controller: controller.into(),
            format: DriveFormat::Qcow2,
            bootindex: None,
            serial: None,
        }
    }
}

/// Frozen at `start_vm`; discovered values (firmware paths, synthesized
/// MACs) are reported back to the parent, never mutated mid-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    pub arch: Arch,
    pub cpus: u32,
    pub ram_mb: u64,
    #[serde(default)]
    pub machine: Option<String>,
    pub firmware: Firmware,
    /// QEMU boot order argument, e.g. "c", "d", "once=d".
    #[serde(default)]
    pub boot: Option<String>,
    #[serde(default)]
    pub nics: Vec<Nic>,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub cdroms: Vec<PathBuf>,
    #[serde(default)]
    pub virtio_consoles: u32,
    #[serde(default)]
    pub tpm: Option<TpmDevice>,
    #[serde(default)]
    pub audio: Option<AudioDevice>,
    #[serde(default)]
    pub vga: Option<String>,
    #[serde(default)]
    pub worker_id: u16,
    /// (major, minor) of the qemu binary, when the caller probed it.
    #[serde(default)]
    pub qemu_version: Option<(u32, u32)>,
    pub basedir: PathBuf,
    #[serde(default)]
    pub delayed_start: bool,
}

const BOOT_SOURCES: &[&str] = &["a", "c", "d", "n"];

impl VmConfig {
    pub fn new(arch: Arch, basedir: impl Into<PathBuf>) -> Self {
        VmConfig {
            arch,
            cpus: 1,
            ram_mb: 1024,
            machine: None,
            firmware: Firmware::Bios,
            boot: None,
            nics: Vec::new(),
            disks: Vec::new(),
            cdroms: Vec::new(),
            virtio_consoles: 0,
            tpm: None,
            audio: None,
            vga: None,
            worker_id: 0,
            qemu_version: None,
            basedir: basedir.into(),
            delayed_start: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cpus == 0 {
            return Err(Error::Config("cpu count must be at least 1".into()));
        }
        if self.ram_mb == 0 {
            return Err(Error::Config("ram size must be at least 1 MiB".into()));
        }
        if let Some(boot) = &self.boot {
            let source = boot.strip_prefix("once=").unwrap_or(boot);
            if !BOOT_SOURCES.contains(&source) && !source.starts_with("order=") {
                return Err(Error::Config(format!("unknown boot source '{boot}'")));
            }
        }
        for disk in &self.disks {
            if disk.file.is_none() && disk.size.is_none() {
                return Err(Error::Config(
                    "disk needs either a base file or a size".into(),
                ));
            }
        }
        for (i, nic) in self.nics.iter().enumerate() {
            if nic.model.is_empty() {
                return Err(Error::Config(format!("nic {i} has no device model")));
            }
        }
        Ok(())
    }

    /// True when the qemu version is at least (major, minor). Unknown
    /// versions are treated as current.
    pub fn qemu_at_least(&self, major: u32, minor: u32) -> bool {
        match self.qemu_version {
            Some((maj, min)) => (maj, min) >= (major, minor),
            None => true,
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.basedir.join("qemu.pid")
    }

    pub fn run_file(&self) -> PathBuf {
        self.basedir.join("backend.run")
    }

    pub fn state_file(&self) -> PathBuf {
        self.basedir.join("blockdevconf.json")
    }

    pub fn qmp_socket(&self) -> PathBuf {
        self.basedir.join("qmp_socket")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.basedir.join("vm-snapshots")
    }
}

/// Runtime knobs that may change while a VM is live. Mutations go through
/// dedicated setters so the config itself stays frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeFlags {
    /// Poll interval the VNC consumer should use, in milliseconds.
    pub request_interval_ms: u64,
    /// Outgoing migration budget in seconds (QEMU_MAX_MIGRATION_TIME).
    pub max_migration_time_s: u64,
    /// Incoming migration budget in seconds.
    pub incoming_migration_time_s: u64,
    /// Guest size in MiB the balloon inflates toward before a snapshot.
    #[serde(default)]
    pub balloon_target_mb: Option<u64>,
    /// Grace window for SIGTERM before escalating to SIGKILL, in seconds.
    pub graceful_shutdown_timeout_s: u64,
    /// Treat switch-daemon dbus failures as warnings.
    #[serde(default)]
    pub non_fatal_dbus: bool,
}

pub const DEFAULT_REQUEST_INTERVAL_MS: u64 = 100;
pub const FROZEN_REQUEST_INTERVAL_MS: u64 = 1000;

impl Default for RuntimeFlags {
    fn default() -> Self {
        RuntimeFlags {
            request_interval_ms: DEFAULT_REQUEST_INTERVAL_MS,
            max_migration_time_s: 240,
            incoming_migration_time_s: 300,
            balloon_target_mb: None,
            graceful_shutdown_timeout_s: 30,
            non_fatal_dbus: false,
        }
    }
}

impl RuntimeFlags {
    /// Defaults with environment overrides applied, read once.
    pub fn from_env() -> Self {
        let mut flags = RuntimeFlags::default();
        if let Some(secs) = std::env::var("QEMU_MAX_MIGRATION_TIME")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            flags.max_migration_time_s = secs;
        }
        flags.non_fatal_dbus = std::env::var("QEMU_NON_FATAL_DBUS_CALL")
            .map(|v| v == "1")
            .unwrap_or(false);
        flags
    }

    pub fn update_request_interval(&mut self, ms: u64) {
        self.request_interval_ms = ms;
    }

    pub fn max_migration_time(&self) -> Duration {
        Duration::from_secs(self.max_migration_time_s)
    }

    pub fn incoming_migration_time(&self) -> Duration {
        Duration::from_secs(self.incoming_migration_time_s)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_s)
    }
}
