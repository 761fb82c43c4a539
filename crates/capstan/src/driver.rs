//! The backend command dispatcher: owns the QEMU process, its QMP
//! connection and the block-device model, and translates control-pipe
//! commands into QMP flows.

use crate::blockdev::{BlockDevModel, PFLASH_MODEL};
use crate::cmdline;
use crate::qmp::QmpClient;
use crate::supervisor::{LogReader, Supervisor, collect_orphans};
use crate::switch;
use capstan_core::{
    DEFAULT_REQUEST_INTERVAL_MS, DriveFormat, DriveMedia, Error, Firmware, FROZEN_REQUEST_INTERVAL_MS,
    NicKind, Result, RuntimeFlags, VmConfig,
};
use capstan_ipc::{Command, Outcome, PowerAction};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// A QEMU log line that indicates the guest's input queue wedged; the
/// run cannot continue meaningfully past it.
const FATAL_LOG_LINE: &str = "key event queue full";

pub struct QemuDriver {
    pub(crate) config: VmConfig,
    pub(crate) flags: RuntimeFlags,
    /// Firmware with discovery applied; an output of `start_vm`.
    pub(crate) firmware: Firmware,
    pub(crate) model: BlockDevModel,
    pub(crate) supervisor: Option<Supervisor>,
    pub(crate) qmp: Option<QmpClient>,
    /// Set by the watchers when qemu exits or logs a fatal line.
    pub(crate) dead: Arc<AtomicBool>,
    /// Suppresses the death flag while we are stopping qemu on purpose.
    pub(crate) expected_exit: bool,
    frozen: bool,
    capturing_audio: bool,
}

impl QemuDriver {
    pub fn new(config: VmConfig, flags: RuntimeFlags) -> Result<Self> {
        config.validate()?;
        let model = BlockDevModel::new(&config.basedir);
        let firmware = config.firmware.clone();
        Ok(QemuDriver {
            config,
            flags,
            firmware,
            model,
            supervisor: None,
            qmp: None,
            dead: Arc::new(AtomicBool::new(false)),
            expected_exit: false,
            frozen: false,
            capturing_audio: false,
        })
    }

    pub fn flags(&self) -> &RuntimeFlags {
        &self.flags
    }

    /// Capability gate surfaced to the test runner before any command is
    /// attempted.
    pub fn can_handle(&self, capability: &str) -> bool {
        match capability {
            "snapshots" => {
                if self.model.is_empty() {
                    !self.config.disks.iter().any(|d| d.controller == "nvme")
                } else {
                    self.model.supports_snapshots()
                }
            }
            _ => false,
        }
    }

    pub(crate) fn qemu_died(&self) -> bool {
        self.dead.load(Ordering::SeqCst) && !self.expected_exit
    }

    pub(crate) fn qmp(&self) -> Result<&QmpClient> {
        if self.qemu_died() {
            return Err(Error::Disconnected);
        }
        match &self.qmp {
            Some(qmp) if qmp.is_connected() => Ok(qmp),
            Some(_) => Err(Error::Disconnected),
            None => Err(Error::NotRunning),
        }
    }

    /// Execute one control-pipe command, mapping errors into the
    /// `{error, message}` response shape.
    pub async fn dispatch(&mut self, command: Command) -> Outcome {
        let name = command.name();
        tracing::debug!(command = name, "dispatching");
        let result = self.run_command(command).await;
        if let Err(e) = &result {
            let status = match &self.qmp {
                Some(qmp) if qmp.is_connected() => {
                    qmp.query_status().await.ok().map(|(status, _)| status)
                }
                _ => None,
            };
            tracing::warn!(
                command = name,
                error = %e,
                qmp_status = status.as_deref().unwrap_or("unavailable"),
                "backend command failed"
            );
        }
        result.into()
    }

    async fn run_command(&mut self, command: Command) -> Result<Value> {
        if self.qemu_died()
            && !matches!(
                command,
                Command::StartVm { .. } | Command::StopVm | Command::CpuStat
            )
        {
            return Err(Error::Disconnected);
        }
        match command {
            Command::StartVm { .. } => self.start_vm().await,
            Command::StopVm => self.stop_vm().await,
            Command::Power { action } => self.power(action).await,
            Command::EjectCd => self.eject_cd().await,
            Command::SaveSnapshot { name } => self.save_snapshot(&name).await,
            Command::LoadSnapshot { name } => self.load_snapshot(&name).await,
            Command::ExtractAssets {
                hdd_num,
                pflash_vars,
                name,
                dir,
                format,
            } => {
                self.extract_assets(hdd_num, pflash_vars, &name, &dir, &format)
                    .await
            }
            Command::StartAudiocapture { filename } => self.start_audiocapture(&filename).await,
            Command::StopAudiocapture => self.stop_audiocapture().await,
            Command::CpuStat => self.cpu_stat(),
            Command::IsShutdown => self.is_shutdown().await,
            Command::FreezeVm => self.freeze_vm().await,
            Command::ContVm => self.cont_vm().await,
            Command::MouseHide { border_offset } => self.mouse_hide(border_offset).await,
        }
    }

    pub async fn start_vm(&mut self) -> Result<Value> {
        if self.supervisor.as_ref().is_some_and(|s| s.is_running()) {
            return Err(Error::AlreadyRunning);
        }
        std::fs::create_dir_all(&self.config.basedir)?;
        std::fs::create_dir_all(self.config.snapshot_dir())?;

        self.firmware = cmdline::resolve_firmware(&self.config)?;
        self.init_model()?;
        let snapshots_supported = self.model.supports_snapshots();

        self.prepare_storage().await?;
        self.create_console_fifos()?;
        for nic in &self.config.nics {
            if let NicKind::Tap { ifname, .. } = &nic.kind {
                switch::set_vlan(ifname, self.config.worker_id, self.flags.non_fatal_dbus).await?;
            }
        }

        let (argv, discovered) = cmdline::build_argv(
            &self.config,
            &self.model,
            &self.firmware,
            snapshots_supported,
            false,
        )?;
        self.spawn_qemu(&argv).await?;
        std::fs::write(self.config.run_file(), "{\"backend\":\"qemu\"}\n")?;

        self.connect_qmp().await?;
        if !self.config.delayed_start {
            self.qmp()?.execute("cont", None).await?;
        }

        let pid = self.supervisor.as_ref().map(|s| s.pid().as_raw());
        Ok(json!({ "pid": pid, "discovered": discovered }))
    }

    /// Spawn the process and wire up the exit and log watchers. Shared
    /// with the snapshot-load re-exec.
    pub(crate) async fn spawn_qemu(&mut self, argv: &[String]) -> Result<()> {
        self.dead.store(false, Ordering::SeqCst);
        self.expected_exit = false;

        let mut supervisor = Supervisor::spawn(
            argv,
            &[],
            &self.config.basedir,
            &self.config.pid_file(),
        )
        .await?;

        let dead = self.dead.clone();
        let mut exit_rx = supervisor.exit_watch();
        tokio::spawn(async move {
            if exit_rx.wait_for(|status| status.is_some()).await.is_ok() {
                dead.store(true, Ordering::SeqCst);
            }
        });

        if let Some(log) = supervisor.take_log_reader() {
            tokio::spawn(watch_log(log, self.dead.clone()));
        }

        self.supervisor = Some(supervisor);
        Ok(())
    }

    /// The monitor socket appears a moment after exec; retry briefly.
    pub(crate) async fn connect_qmp(&mut self) -> Result<()> {
        let path = self.config.qmp_socket();
        let mut last = Error::NotRunning;
        for attempt in 1..=50u64 {
            if self.dead.load(Ordering::SeqCst) {
                return Err(Error::Spawn("qemu exited before the QMP handshake".into()));
            }
            match QmpClient::connect(&path).await {
                Ok(qmp) => {
                    self.qmp = Some(qmp);
                    return Ok(());
                }
                Err(e) => {
                    last = e;
                    sleep(Duration::from_millis(100.min(20 * attempt))).await;
                }
            }
        }
        Err(last)
    }

    pub async fn stop_vm(&mut self) -> Result<Value> {
        self.teardown_qemu(false).await?;
        self.persist_model()?;
        remove_if_exists(&self.config.run_file());
        Ok(json!({}))
    }

    /// Quit or kill qemu. With `stop_only_qemu` the tap/VLAN wiring is
    /// left untouched so a snapshot load can re-exec into the same
    /// network.
    pub(crate) async fn teardown_qemu(&mut self, stop_only_qemu: bool) -> Result<()> {
        self.expected_exit = true;
        if let Some(qmp) = self.qmp.take() {
            if qmp.is_connected() {
                let _ = qmp.call_timeout("quit", None, Duration::from_secs(3)).await;
            }
        }
        if let Some(mut supervisor) = self.supervisor.take() {
            supervisor.stop(self.flags.graceful_shutdown_timeout()).await?;
            collect_orphans(&[supervisor.pid()]);
        }
        if !stop_only_qemu {
            for nic in &self.config.nics {
                if let NicKind::Tap { ifname, .. } = &nic.kind {
                    switch::unset_vlan(ifname, self.flags.non_fatal_dbus).await?;
                }
            }
        }
        Ok(())
    }

    async fn power(&mut self, action: PowerAction) -> Result<Value> {
        match action {
            PowerAction::Acpi => {
                self.qmp()?.execute("system_powerdown", None).await?;
            }
            PowerAction::Reset => {
                self.qmp()?.execute("system_reset", None).await?;
            }
            PowerAction::Off => {
                self.expected_exit = true;
                self.qmp()?.execute("quit", None).await?;
            }
        }
        Ok(json!({}))
    }

    async fn eject_cd(&mut self) -> Result<Value> {
        self.qmp()?
            .execute("eject", Some(json!({ "device": "cd0" })))
            .await?;
        Ok(json!({}))
    }

    async fn start_audiocapture(&mut self, filename: &Path) -> Result<Value> {
        if self.capturing_audio {
            return Err(Error::Config("audio capture already running".into()));
        }
        let line = match (&self.config.audio, self.config.qemu_at_least(4, 2)) {
            (Some(audio), true) => {
                format!("wavcapture {} {} 44100 16 1", filename.display(), audio.id)
            }
            _ => format!("wavcapture {} 44100 16 1", filename.display()),
        };
        self.qmp()?.human_monitor(&line).await?;
        self.capturing_audio = true;
        Ok(json!({}))
    }

    async fn stop_audiocapture(&mut self) -> Result<Value> {
        self.qmp()?.human_monitor("stopcapture 0").await?;
        self.capturing_audio = false;
        Ok(json!({}))
    }

    fn cpu_stat(&self) -> Result<Value> {
        let supervisor = self.supervisor.as_ref().ok_or(Error::NotRunning)?;
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", supervisor.pid()))?;
        let (user, system) = parse_proc_stat(&stat)
            .ok_or_else(|| Error::Protocol("unparseable /proc stat line".into()))?;
        Ok(json!([user, system]))
    }

    async fn is_shutdown(&mut self) -> Result<Value> {
        let (status, _) = self.qmp()?.query_status().await?;
        Ok(json!(status == "shutdown"))
    }

    async fn freeze_vm(&mut self) -> Result<Value> {
        self.qmp()?.execute("stop", None).await?;
        self.frozen = true;
        // VNC consumers back off while nothing can change on screen
        self.flags.update_request_interval(FROZEN_REQUEST_INTERVAL_MS);
        Ok(json!({ "request_interval_ms": self.flags.request_interval_ms }))
    }

    async fn cont_vm(&mut self) -> Result<Value> {
        self.qmp()?.execute("cont", None).await?;
        self.frozen = false;
        self.flags.update_request_interval(DEFAULT_REQUEST_INTERVAL_MS);
        Ok(json!({ "request_interval_ms": self.flags.request_interval_ms }))
    }

    /// Park the absolute pointer past the framebuffer edge so it is not
    /// visible in screenshots.
    async fn mouse_hide(&mut self, border_offset: u32) -> Result<Value> {
        let position = 0x7fffu32.saturating_sub(border_offset);
        self.qmp()?
            .execute(
                "input-send-event",
                Some(json!({
                    "events": [
                        { "type": "abs", "data": { "axis": "x", "value": position } },
                        { "type": "abs", "data": { "axis": "y", "value": position } },
                    ]
                })),
            )
            .await?;
        Ok(json!({ "x": position, "y": position }))
    }

    /// Build the model from the config, or reload the persisted one so
    /// snapshot sequence numbers survive a backend restart.
    pub(crate) fn init_model(&mut self) -> Result<()> {
        let state_file = self.config.state_file();
        if state_file.exists() {
            let raw = std::fs::read_to_string(&state_file)?;
            self.model = BlockDevModel::from_map(serde_json::from_str(&raw)?)?;
            tracing::info!(path = %state_file.display(), "restored block device state");
            return Ok(());
        }
        if !self.model.is_empty() {
            return Ok(());
        }

        let mut model = BlockDevModel::new(&self.config.basedir);
        for (index, disk) in self.config.disks.iter().enumerate() {
            let controller_id = controller_id_for(&disk.controller);
            if model.controller(&controller_id).is_none() {
                model.add_controller(&disk.controller, &controller_id)?;
            }
            let drive_id = format!("hd{index}");
            let (file, readonly_base) = match &disk.file {
                Some(file) => (file.clone(), true),
                None => (
                    self.config.basedir.join(format!("{drive_id}.qcow2")),
                    false,
                ),
            };
            model.add_drive(
                &drive_id,
                DriveMedia::Disk,
                file,
                disk.format,
                disk.size,
                readonly_base,
            )?;
            model.attach(&drive_id, &controller_id)?;
            if let Some(drive) = model.drive_mut(&drive_id) {
                drive.bootindex = disk.bootindex;
                drive.serial = disk.serial.clone();
            }
        }
        for (index, iso) in self.config.cdroms.iter().enumerate() {
            if model.controller("ide0").is_none() {
                model.add_controller("ide", "ide0")?;
            }
            let drive_id = format!("cd{index}");
            model.add_drive(&drive_id, DriveMedia::Cdrom, iso, DriveFormat::Raw, None, false)?;
            model.attach(&drive_id, "ide0")?;
        }
        if let Firmware::UefiSplit { vars: Some(vars), .. } = &self.firmware {
            model.add_controller(PFLASH_MODEL, "pflash")?;
            model.add_drive(
                "pflash-vars",
                DriveMedia::Disk,
                vars,
                DriveFormat::Raw,
                None,
                true,
            )?;
            model.attach("pflash-vars", "pflash")?;
        }
        self.model = model;
        Ok(())
    }

    /// Create blank base images and the thin overlays over read-only
    /// bases, where missing.
    pub(crate) async fn prepare_storage(&self) -> Result<()> {
        for drive in self.model.drives() {
            if !drive.file.exists() {
                if let Some(size) = drive.size {
                    qemu_img_create(&drive.file, drive.format, None, None, Some(size)).await?;
                } else {
                    return Err(Error::Config(format!(
                        "base image '{}' does not exist",
                        drive.file.display()
                    )));
                }
            }
            for overlay in &drive.overlays {
                if overlay.sequence == 0 && !overlay.file.exists() {
                    qemu_img_create(
                        &overlay.file,
                        DriveFormat::Qcow2,
                        Some(&drive.file),
                        Some(drive.format),
                        None,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    fn create_console_fifos(&self) -> Result<()> {
        for index in 0..self.config.virtio_consoles {
            let name = cmdline::console_name(index);
            for suffix in ["in", "out"] {
                let path = self.config.basedir.join(format!("{name}.{suffix}"));
                match mkfifo(&path, Mode::from_bits_truncate(0o600)) {
                    Ok(()) => {}
                    Err(nix::errno::Errno::EEXIST) => {}
                    Err(e) => return Err(std::io::Error::from(e).into()),
                }
            }
        }
        Ok(())
    }

    pub(crate) fn persist_model(&self) -> Result<()> {
        if self.model.is_empty() {
            return Ok(());
        }
        let map = self.model.to_map()?;
        std::fs::write(
            self.config.state_file(),
            serde_json::to_string_pretty(&map)?,
        )?;
        Ok(())
    }

    /// Final teardown when the control pipe closes underneath us.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stop_vm().await {
            tracing::warn!(error = %e, "teardown after pipe close failed");
        }
        collect_orphans(&[]);
    }
}

async fn watch_log(mut log: LogReader, dead: Arc<AtomicBool>) {
    while let Ok(Some(line)) = log.next_line().await {
        tracing::debug!(target: "qemu", "{line}");
        if line.contains(FATAL_LOG_LINE) {
            tracing::error!("qemu reported '{FATAL_LOG_LINE}', marking the VM dead");
            dead.store(true, Ordering::SeqCst);
        }
    }
}

fn controller_id_for(model: &str) -> String {
    match model {
        "virtio-scsi-pci" | "virtio-scsi" => "scsi0".to_string(),
        other => format!("{other}0"),
    }
}

/// Create an image with `qemu-img`: either a blank one of `size` bytes or
/// an overlay backed by `backing`.
pub(crate) async fn qemu_img_create(
    file: &Path,
    format: DriveFormat,
    backing: Option<&Path>,
    backing_format: Option<DriveFormat>,
    size: Option<u64>,
) -> Result<()> {
    let binary = which::which("qemu-img")
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "qemu-img".to_string());
    let mut command = tokio::process::Command::new(binary);
    command.arg("create").arg("-f").arg(format.as_str());
    if let Some(backing) = backing {
        command.arg("-b").arg(backing);
        command
            .arg("-F")
            .arg(backing_format.unwrap_or(DriveFormat::Qcow2).as_str());
    }
    command.arg(file);
    if let Some(size) = size {
        command.arg(size.to_string());
    }
    let output = command.output().await?;
    if !output.status.success() {
        return Err(Error::Config(format!(
            "qemu-img create {} failed: {}",
            file.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "could not remove file");
        }
    }
}

/// utime/stime in seconds from a `/proc/<pid>/stat` line. The comm field
/// may contain spaces, so parsing starts after the closing paren.
pub(crate) fn parse_proc_stat(stat: &str) -> Option<(f64, f64)> {
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // state is field 0 here; utime/stime are fields 14/15 of the full line
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks = ticks_per_second();
    Some((utime as f64 / ticks, stime as f64 / ticks))
}

fn ticks_per_second() -> f64 {
    match nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as f64,
        _ => 100.0,
    }
}
