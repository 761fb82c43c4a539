//! Snapshot engine: save and restore the full VM state through QMP live
//! migration plus per-drive qcow2 overlays. The VM is paused before any
//! `blockdev-snapshot-sync` and the migration completes before it
//! resumes, so RAM and disks stay consistent from the guest's point of
//! view.

use crate::blockdev::OverlayPlan;
use crate::cmdline;
use crate::driver::QemuDriver;
use capstan_core::{Error, Result};
use serde_json::{Value, json};
use std::os::fd::OwnedFd;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Poll tick while a migration is in flight.
const MIGRATION_POLL: Duration = Duration::from_millis(500);
/// Poll tick for plain status waits.
const STATUS_POLL: Duration = Duration::from_secs(1);
/// Balloon settle budget: iterations of one second each.
const BALLOON_SETTLE_ROUNDS: u32 = 5;

impl QemuDriver {
    pub async fn save_snapshot(&mut self, name: &str) -> Result<Value> {
        if !self.can_handle("snapshots") {
            return Err(Error::Unsupported(
                "snapshots are not possible with nvme drives".into(),
            ));
        }

        let (status, was_running) = self.qmp()?.query_status().await?;
        tracing::info!(name, %status, "saving snapshot");
        if was_running {
            self.inflate_balloon().await;
            self.qmp()?.execute("stop", None).await?;
        }
        // console ringbuffers are snapshotted by the runner at this point

        let plans = self.model.take_snapshot(name)?;
        self.persist_model()?;
        for plan in &plans {
            self.blockdev_snapshot_sync(plan).await?;
        }

        self.enable_migration_capabilities().await?;
        self.qmp()?
            .execute(
                "migrate-set-parameters",
                Some(json!({
                    "compress-level": 1,
                    "compress-threads": compress_threads(),
                    "max-bandwidth": i64::MAX,
                })),
            )
            .await?;

        let ram_file = self
            .model
            .find_snapshot(name)
            .expect("snapshot was just recorded")
            .ram_file
            .clone();
        let target = self.config.basedir.join(&ram_file);
        let file = std::fs::File::create(&target)?;
        self.qmp()?
            .call_with_fd(
                "getfd",
                Some(json!({ "fdname": name })),
                OwnedFd::from(file),
            )
            .await?
            .into_result()?;
        self.qmp()?
            .execute("migrate", Some(json!({ "uri": format!("fd:{name}") })))
            .await?;

        self.wait_migration_completed().await?;
        self.wait_out_of_intermediate_state().await?;

        if was_running {
            self.qmp()?.execute("cont", None).await?;
            self.deflate_balloon().await;
        }
        Ok(json!({ "snapshot": name, "ram_file": ram_file }))
    }

    pub async fn load_snapshot(&mut self, name: &str) -> Result<Value> {
        if !self.can_handle("snapshots") {
            return Err(Error::Unsupported(
                "snapshots are not possible with nvme drives".into(),
            ));
        }
        let ram_file = self
            .model
            .find_snapshot(name)
            .ok_or_else(|| Error::Config(format!("unknown snapshot '{name}'")))?
            .ram_file
            .clone();

        if let Ok(qmp) = self.qmp() {
            if let Ok((_, running)) = qmp.query_status().await {
                if running {
                    let _ = self.qmp()?.execute("stop", None).await;
                }
            }
        }
        tracing::info!(name, "loading snapshot, console streams paused");

        // Keep tap/VLAN wiring: only the qemu process is replaced.
        self.teardown_qemu(true).await?;

        for file in self.model.revert_to(name)? {
            if let Err(e) = std::fs::remove_file(&file) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %file.display(), error = %e, "stale overlay not removed");
                }
            }
        }
        self.persist_model()?;

        let (argv, _) = cmdline::build_argv(
            &self.config,
            &self.model,
            &self.firmware,
            true,
            true,
        )?;
        self.spawn_qemu(&argv).await?;
        self.connect_qmp().await?;
        self.enable_migration_capabilities().await?;

        // fd: is unreliable for incoming migration in qemu, exec: is the
        // stable spelling (qemu's cwd is the pool directory).
        self.qmp()?
            .execute(
                "migrate-incoming",
                Some(json!({ "uri": format!("exec:cat {}", ram_file.display()) })),
            )
            .await?;

        self.wait_incoming_migration().await?;
        self.qmp()?.execute("cont", None).await?;
        self.deflate_balloon().await;
        tracing::info!(name, "snapshot restored, console streams resumed");
        Ok(json!({ "snapshot": name }))
    }

    /// Copy one block node out of the backing chain as a standalone image.
    pub async fn extract_assets(
        &mut self,
        hdd_num: Option<u32>,
        pflash_vars: bool,
        name: &str,
        dir: &Path,
        format: &str,
    ) -> Result<Value> {
        if self.model.is_empty() {
            self.init_model()?;
            if self.model.is_empty() {
                return Err(Error::Config(
                    "no block device state to extract assets from".into(),
                ));
            }
        }
        let selector = if pflash_vars {
            "pflash-vars".to_string()
        } else if let Some(num) = hdd_num {
            format!("hd{num}")
        } else {
            return Err(Error::Config("no asset selector given".into()));
        };

        let matched: Vec<_> = self
            .model
            .drives()
            .iter()
            .filter(|drive| drive.id == selector)
            .collect();
        let drive = match matched.as_slice() {
            [drive] => *drive,
            [] => {
                return Err(Error::Config(format!(
                    "no drive matches selector '{selector}'"
                )));
            }
            _ => {
                return Err(Error::Config(format!(
                    "selector '{selector}' is ambiguous"
                )));
            }
        };

        std::fs::create_dir_all(dir)?;
        let target = dir.join(name);
        qemu_img_convert(drive.live_file(), &target, format).await?;
        Ok(json!({ "asset": target }))
    }

    /// `blockdev-snapshot-sync` with the node name of the new overlay
    /// over the live node. Devices set up with legacy `-drive` syntax
    /// autogenerate their node names, so on error the call is retried
    /// addressing the device instead.
    async fn blockdev_snapshot_sync(&mut self, plan: &OverlayPlan) -> Result<()> {
        let response = self
            .qmp()?
            .call(
                "blockdev-snapshot-sync",
                Some(json!({
                    "node-name": plan.prev_node,
                    "snapshot-file": plan.file,
                    "format": "qcow2",
                    "snapshot-node-name": plan.node_name,
                })),
            )
            .await?;
        if response.is_error() {
            tracing::debug!(
                drive = %plan.drive_id,
                node = %plan.prev_node,
                "snapshot-sync by node-name refused, retrying by device"
            );
            self.qmp()?
                .call(
                    "blockdev-snapshot-sync",
                    Some(json!({
                        "device": plan.drive_id,
                        "snapshot-file": plan.file,
                        "format": "qcow2",
                    })),
                )
                .await?
                .into_result()?;
        }
        Ok(())
    }

    async fn enable_migration_capabilities(&mut self) -> Result<()> {
        self.qmp()?
            .execute(
                "migrate-set-capabilities",
                Some(json!({
                    "capabilities": [
                        { "capability": "events", "state": true },
                        { "capability": "compress", "state": true },
                    ]
                })),
            )
            .await?;
        Ok(())
    }

    async fn wait_migration_completed(&mut self) -> Result<()> {
        let budget = self.flags().max_migration_time();
        let start = Instant::now();
        loop {
            let ret = self.qmp()?.execute("query-migrate", None).await?;
            let status = ret.get("status").and_then(Value::as_str).unwrap_or("");
            if let Some(ram) = ret.get("ram") {
                tracing::info!(
                    total = %ram["total"],
                    remaining = %ram["remaining"],
                    status,
                    "migration progress"
                );
            }
            match status {
                "completed" => return Ok(()),
                "failed" => {
                    return Err(Error::qmp("MigrationFailed", "outgoing migration failed"));
                }
                _ => {}
            }
            if start.elapsed() > budget {
                let _ = self.qmp()?.execute("migrate_cancel", None).await;
                return Err(Error::timeout("migration"));
            }
            sleep(MIGRATION_POLL).await;
        }
    }

    /// QEMU briefly sits in an intermediate state before `postmigrate`;
    /// resuming during that window loses the race.
    async fn wait_out_of_intermediate_state(&mut self) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(10) {
            let (status, _) = self.qmp()?.query_status().await?;
            if status != "paused" && status != "finish-migrate" {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    async fn wait_incoming_migration(&mut self) -> Result<()> {
        let budget = self.flags().incoming_migration_time();
        let start = Instant::now();
        loop {
            let (status, _) = self.qmp()?.query_status().await?;
            if !status.contains("migrate") {
                return Ok(());
            }
            if start.elapsed() > budget {
                return Err(Error::timeout("incoming migration"));
            }
            sleep(STATUS_POLL).await;
        }
    }

    /// Hand guest memory back to the host before the migration stream is
    /// written. Best effort: a stubborn balloon is logged, not fatal.
    async fn inflate_balloon(&mut self) {
        let Some(target_mb) = self.flags().balloon_target_mb else {
            return;
        };
        let result: Result<()> = async {
            self.qmp()?
                .execute("balloon", Some(json!({ "value": target_mb * 1024 * 1024 })))
                .await?;
            let mut previous = u64::MAX;
            for _ in 0..BALLOON_SETTLE_ROUNDS {
                sleep(Duration::from_secs(1)).await;
                let ret = self.qmp()?.execute("query-balloon", None).await?;
                let actual = ret.get("actual").and_then(Value::as_u64).unwrap_or(0);
                if actual >= previous {
                    break;
                }
                previous = actual;
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "balloon inflate did not settle");
        }
    }

    async fn deflate_balloon(&mut self) {
        if self.flags().balloon_target_mb.is_none() {
            return;
        }
        let bytes = self.config.ram_mb * 1024 * 1024;
        let result: Result<Value> = async {
            self.qmp()?
                .execute("balloon", Some(json!({ "value": bytes })))
                .await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "balloon deflate failed");
        }
    }
}

fn compress_threads() -> u32 {
    std::thread::available_parallelism()
        .map(|n| (n.get() as u32 / 2).max(2))
        .unwrap_or(2)
}

async fn qemu_img_convert(source: &Path, target: &Path, format: &str) -> Result<()> {
    let binary = which::which("qemu-img")
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "qemu-img".to_string());
    let output = tokio::process::Command::new(binary)
        .arg("convert")
        .arg("-O")
        .arg(format)
        .arg(source)
        .arg(target)
        .output()
        .await?;
    if !output.status.success() {
        return Err(Error::Config(format!(
            "qemu-img convert {} failed: {}",
            source.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
