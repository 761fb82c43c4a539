//! Declarative model of the VM's storage tree: controllers, drives,
//! multipath attachments, copy-on-write overlays and named snapshots.
//!
//! All nodes live in id-keyed arenas and reference each other by id, so
//! the model serializes losslessly and can be rebuilt after a backend
//! restart. The same model emits the `-blockdev`/`-device` command line
//! and plans `blockdev-snapshot-sync` requests, which keeps argv
//! generation and snapshot bookkeeping from drifting apart.

use capstan_core::{DriveFormat, DriveMedia, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Controller model that marks a drive as a pflash `-drive` (legacy
/// syntax, autogenerated node names).
pub const PFLASH_MODEL: &str = "pflash-drive";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controller {
    pub id: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrivePath {
    pub id: String,
    /// Back-reference into the controller arena.
    pub controller: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overlay {
    pub node_name: String,
    pub file: PathBuf,
    /// Snapshot sequence this overlay belongs to; 0 for the thin overlay
    /// protecting a read-only base.
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub id: String,
    pub media: DriveMedia,
    pub file: PathBuf,
    pub format: DriveFormat,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub bootindex: Option<u32>,
    #[serde(default)]
    pub cache: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
    pub paths: Vec<DrivePath>,
    #[serde(default)]
    pub overlays: Vec<Overlay>,
}

impl Drive {
    /// Head of the overlay chain; the node the guest actually writes to.
    pub fn live_node(&self) -> String {
        self.overlays
            .last()
            .map(|overlay| overlay.node_name.clone())
            .unwrap_or_else(|| self.id.clone())
    }

    /// The node directly under the live one.
    pub fn backing_node(&self) -> String {
        match self.overlays.len() {
            0 | 1 => self.id.clone(),
            n => self.overlays[n - 2].node_name.clone(),
        }
    }

    /// File backing the live node.
    pub fn live_file(&self) -> &Path {
        self.overlays
            .last()
            .map(|overlay| overlay.file.as_path())
            .unwrap_or(self.file.as_path())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub name: String,
    pub sequence: u64,
    /// Migration stream location, relative to the pool directory.
    pub ram_file: PathBuf,
}

/// What `blockdev-snapshot-sync` must do for one drive when a snapshot is
/// taken: overlay `node_name`/`file` over `prev_node`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayPlan {
    pub drive_id: String,
    pub prev_node: String,
    pub node_name: String,
    pub file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDevModel {
    basedir: PathBuf,
    controllers: Vec<Controller>,
    drives: Vec<Drive>,
    snapshots: Vec<SnapshotRecord>,
    /// Next snapshot sequence; strictly monotonic, never reused, survives
    /// restarts through serialization.
    next_sequence: u64,
}

impl BlockDevModel {
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        BlockDevModel {
            basedir: basedir.into(),
            controllers: Vec::new(),
            drives: Vec::new(),
            snapshots: Vec::new(),
            next_sequence: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty() && self.drives.is_empty()
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    pub fn controllers(&self) -> &[Controller] {
        &self.controllers
    }

    pub fn drives(&self) -> &[Drive] {
        &self.drives
    }

    pub fn snapshots(&self) -> &[SnapshotRecord] {
        &self.snapshots
    }

    pub fn controller(&self, id: &str) -> Option<&Controller> {
        self.controllers.iter().find(|c| c.id == id)
    }

    pub fn drive(&self, id: &str) -> Option<&Drive> {
        self.drives.iter().find(|d| d.id == id)
    }

    pub(crate) fn drive_mut(&mut self, id: &str) -> Option<&mut Drive> {
        self.drives.iter_mut().find(|d| d.id == id)
    }

    pub fn find_snapshot(&self, name: &str) -> Option<&SnapshotRecord> {
        self.snapshots.iter().find(|s| s.name == name)
    }

    pub fn add_controller(&mut self, model: &str, id: &str) -> Result<()> {
        validate_id(id)?;
        if self.controller(id).is_some() {
            return Err(Error::Config(format!("duplicate controller id '{id}'")));
        }
        self.controllers.push(Controller {
            id: id.to_string(),
            model: model.to_string(),
        });
        Ok(())
    }

    /// Register a drive. Cdroms and read-only bases get a thin qcow2
    /// overlay node immediately so guest writes never land in the base
    /// image; the overlay file itself is created by the driver before
    /// spawn.
    pub fn add_drive(
        &mut self,
        id: &str,
        media: DriveMedia,
        file: impl Into<PathBuf>,
        format: DriveFormat,
        size: Option<u64>,
        readonly_base: bool,
    ) -> Result<()> {
        validate_id(id)?;
        if self.drive(id).is_some() {
            return Err(Error::Config(format!("duplicate drive id '{id}'")));
        }
        let mut drive = Drive {
            id: id.to_string(),
            media,
            file: file.into(),
            format,
            size,
            bootindex: None,
            cache: None,
            serial: None,
            paths: Vec::new(),
            overlays: Vec::new(),
        };
        if media == DriveMedia::Cdrom || readonly_base {
            drive.overlays.push(Overlay {
                node_name: format!("{id}-0"),
                file: self.overlay_file(id, 0),
                sequence: 0,
            });
        }
        self.drives.push(drive);
        Ok(())
    }

    /// Attach a drive to a controller, adding one path. The first path is
    /// the primary; additional paths model multipath.
    pub fn attach(&mut self, drive_id: &str, controller_id: &str) -> Result<String> {
        if self.controller(controller_id).is_none() {
            return Err(Error::Config(format!(
                "unknown controller '{controller_id}'"
            )));
        }
        let drive = self
            .drives
            .iter_mut()
            .find(|d| d.id == drive_id)
            .ok_or_else(|| Error::Config(format!("unknown drive '{drive_id}'")))?;
        let path_id = format!("{}-path{}", drive_id, drive.paths.len());
        drive.paths.push(DrivePath {
            id: path_id.clone(),
            controller: controller_id.to_string(),
        });
        Ok(path_id)
    }

    /// NVMe cannot be live-migrated by QEMU, so any nvme path disables
    /// snapshot support for the whole machine.
    pub fn supports_snapshots(&self) -> bool {
        !self.drives.iter().any(|drive| {
            drive.paths.iter().any(|path| {
                self.controller(&path.controller)
                    .is_some_and(|c| c.model == "nvme")
            })
        })
    }

    /// Record a snapshot and append one overlay per drive. Returns the
    /// per-drive sync plan; the overlay files are created by QEMU when
    /// `blockdev-snapshot-sync` runs.
    pub fn take_snapshot(&mut self, name: &str) -> Result<Vec<OverlayPlan>> {
        if self.find_snapshot(name).is_some() {
            return Err(Error::Config(format!("duplicate snapshot name '{name}'")));
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let mut plans = Vec::with_capacity(self.drives.len());
        let basedir = self.basedir.clone();
        for drive in &mut self.drives {
            let prev_node = drive
                .overlays
                .last()
                .map(|overlay| overlay.node_name.clone())
                .unwrap_or_else(|| drive.id.clone());
            let node_name = format!("{}-{}", drive.id, sequence);
            let file = basedir.join(format!("{}-{}.qcow2", drive.id, sequence));
            drive.overlays.push(Overlay {
                node_name: node_name.clone(),
                file: file.clone(),
                sequence,
            });
            plans.push(OverlayPlan {
                drive_id: drive.id.clone(),
                prev_node,
                node_name,
                file,
            });
        }
        self.snapshots.push(SnapshotRecord {
            name: name.to_string(),
            sequence,
            ram_file: PathBuf::from("vm-snapshots").join(name),
        });
        Ok(plans)
    }

    /// Truncate history back to `name`: snapshots after it are forgotten
    /// and every drive drops the overlays created since. Returns the
    /// overlay files to delete. `next_sequence` is not rewound, so
    /// sequence numbers are never reused.
    pub fn revert_to(&mut self, name: &str) -> Result<Vec<PathBuf>> {
        let target = self
            .find_snapshot(name)
            .ok_or_else(|| Error::Config(format!("unknown snapshot '{name}'")))?
            .sequence;
        self.snapshots.retain(|s| s.sequence <= target);
        let mut dropped = Vec::new();
        for drive in &mut self.drives {
            while drive
                .overlays
                .last()
                .is_some_and(|overlay| overlay.sequence > target)
            {
                dropped.push(drive.overlays.pop().unwrap().file);
            }
        }
        Ok(dropped)
    }

    /// Stable overlay filename: the same drive and sequence always map to
    /// the same path, so saved states remain loadable after a restart.
    pub fn overlay_file(&self, drive_id: &str, sequence: u64) -> PathBuf {
        self.basedir.join(format!("{drive_id}-{sequence}.qcow2"))
    }

    /// Emit the storage part of the QEMU command line: controllers first,
    /// then per drive the `-blockdev` backing chain and the `-device`
    /// binding per path. Deterministic in the model's insertion order.
    pub fn gen_cmdline(&self) -> Vec<String> {
        let mut args = Vec::new();

        for controller in &self.controllers {
            if let Some(device) = controller_device(&controller.model) {
                args.push("-device".into());
                args.push(format!("{},id={}", device, controller.id));
            }
        }

        for drive in &self.drives {
            if self.is_pflash(drive) {
                args.push("-drive".into());
                args.push(format!(
                    "id={},if=pflash,unit=1,format={},file={}",
                    drive.id,
                    if drive.overlays.is_empty() {
                        drive.format.as_str()
                    } else {
                        "qcow2"
                    },
                    drive.live_file().display(),
                ));
                continue;
            }

            let cache = cache_options(drive.cache.as_deref());
            args.push("-blockdev".into());
            args.push(format!(
                "driver=file,node-name={}-file,filename={}{}",
                drive.id,
                drive.file.display(),
                cache,
            ));
            args.push("-blockdev".into());
            args.push(format!(
                "driver={},node-name={},file={}-file{}",
                drive.format.as_str(),
                drive.id,
                drive.id,
                cache,
            ));

            let mut backing = drive.id.clone();
            for overlay in &drive.overlays {
                args.push("-blockdev".into());
                args.push(format!(
                    "driver=file,node-name={}-file,filename={}{}",
                    overlay.node_name,
                    overlay.file.display(),
                    cache,
                ));
                args.push("-blockdev".into());
                args.push(format!(
                    "driver=qcow2,node-name={},file={}-file,backing={}{}",
                    overlay.node_name, overlay.node_name, backing, cache,
                ));
                backing = overlay.node_name.clone();
            }

            let live = drive.live_node();
            for (index, path) in drive.paths.iter().enumerate() {
                let model = self
                    .controller(&path.controller)
                    .map(|c| c.model.as_str())
                    .unwrap_or_default();
                let (device, on_bus) = drive_device(model, drive.media);
                let mut line = format!("{},id={},drive={}", device, path.id, live);
                if on_bus {
                    line.push_str(&format!(",bus={}.0", path.controller));
                }
                if index == 0 {
                    if let Some(bootindex) = drive.bootindex {
                        line.push_str(&format!(",bootindex={bootindex}"));
                    }
                    match (&drive.serial, device) {
                        (Some(serial), _) => line.push_str(&format!(",serial={serial}")),
                        // nvme refuses to start without a serial
                        (None, "nvme") => line.push_str(&format!(",serial={}", drive.id)),
                        _ => {}
                    }
                } else {
                    line.push_str(",share-rw=on");
                }
                args.push("-device".into());
                args.push(line);
            }
        }

        args
    }

    fn is_pflash(&self, drive: &Drive) -> bool {
        drive.paths.first().is_some_and(|path| {
            self.controller(&path.controller)
                .is_some_and(|c| c.model == PFLASH_MODEL)
        })
    }

    /// Lossless serialization to a plain JSON tree.
    pub fn to_map(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_map(map: Value) -> Result<Self> {
        let model: BlockDevModel = serde_json::from_value(map)?;
        model.validate()?;
        Ok(model)
    }

    /// Invariants enforced on load: unique ids, existing controller
    /// references, strictly growing snapshot sequence numbers.
    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for controller in &self.controllers {
            validate_id(&controller.id)?;
            if !seen.insert(controller.id.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate controller id '{}'",
                    controller.id
                )));
            }
        }
        let mut drive_ids = std::collections::BTreeSet::new();
        for drive in &self.drives {
            validate_id(&drive.id)?;
            if !drive_ids.insert(drive.id.as_str()) {
                return Err(Error::Config(format!("duplicate drive id '{}'", drive.id)));
            }
            if drive.paths.is_empty() {
                return Err(Error::Config(format!("drive '{}' has no path", drive.id)));
            }
            for path in &drive.paths {
                if self.controller(&path.controller).is_none() {
                    return Err(Error::Config(format!(
                        "drive '{}' references unknown controller '{}'",
                        drive.id, path.controller
                    )));
                }
            }
        }
        let mut last = 0;
        for snapshot in &self.snapshots {
            if snapshot.sequence <= last {
                return Err(Error::Config(format!(
                    "snapshot '{}' breaks sequence ordering",
                    snapshot.name
                )));
            }
            last = snapshot.sequence;
        }
        if self.next_sequence <= last {
            return Err(Error::Config("snapshot counter behind history".into()));
        }
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "id '{id}' contains reserved characters"
        )))
    }
}

/// Standalone `-device` line for a controller, when it needs one.
fn controller_device(model: &str) -> Option<&str> {
    match model {
        "virtio-scsi-pci" | "virtio-scsi" => Some("virtio-scsi-pci"),
        "ahci" => Some("ahci"),
        // ide is machine-provided; virtio-blk, nvme and pflash bind per drive
        _ => None,
    }
}

/// Device name binding a drive to its controller, and whether the device
/// sits on the controller's bus.
fn drive_device(model: &str, media: DriveMedia) -> (&'static str, bool) {
    match (model, media) {
        ("virtio-scsi-pci" | "virtio-scsi", DriveMedia::Disk) => ("scsi-hd", true),
        ("virtio-scsi-pci" | "virtio-scsi", DriveMedia::Cdrom) => ("scsi-cd", true),
        ("ahci", DriveMedia::Disk) => ("ide-hd", true),
        ("ahci", DriveMedia::Cdrom) => ("ide-cd", true),
        ("ide", DriveMedia::Disk) => ("ide-hd", false),
        ("ide", DriveMedia::Cdrom) => ("ide-cd", false),
        ("nvme", _) => ("nvme", false),
        (_, DriveMedia::Cdrom) => ("ide-cd", false),
        _ => ("virtio-blk", false),
    }
}

fn cache_options(cache: Option<&str>) -> &'static str {
    match cache {
        Some("none") => ",cache.direct=on",
        Some("unsafe") => ",cache.no-flush=on",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model() -> BlockDevModel {
        let mut model = BlockDevModel::new("/pool/1");
        model.add_controller("virtio-blk", "virtio-blk0").unwrap();
        model
            .add_drive(
                "hd0",
                DriveMedia::Disk,
                "/pool/1/hd0.qcow2",
                DriveFormat::Qcow2,
                Some(10 << 30),
                false,
            )
            .unwrap();
        model.attach("hd0", "virtio-blk0").unwrap();
        model
    }

    mod arenas {
        use super::*;

        #[test]
        fn rejects_duplicate_ids() {
            let mut model = sample_model();
            assert!(matches!(
                model.add_controller("ahci", "virtio-blk0"),
                Err(Error::Config(_))
            ));
            assert!(matches!(
                model.add_drive(
                    "hd0",
                    DriveMedia::Disk,
                    "/x",
                    DriveFormat::Raw,
                    None,
                    false
                ),
                Err(Error::Config(_))
            ));
        }

        #[test]
        fn rejects_reserved_characters() {
            let mut model = BlockDevModel::new("/pool/1");
            assert!(matches!(
                model.add_controller("ahci", "bad id,with=stuff"),
                Err(Error::Config(_))
            ));
        }

        #[test]
        fn attach_requires_known_nodes() {
            let mut model = sample_model();
            assert!(model.attach("hd0", "nope").is_err());
            assert!(model.attach("nope", "virtio-blk0").is_err());
        }

        #[test]
        fn multipath_gets_distinct_path_ids() {
            let mut model = sample_model();
            model.add_controller("virtio-scsi-pci", "scsi1").unwrap();
            let second = model.attach("hd0", "scsi1").unwrap();
            assert_eq!(second, "hd0-path1");
            assert_eq!(model.drive("hd0").unwrap().paths.len(), 2);
        }
    }

    mod overlays {
        use super::*;

        #[test]
        fn cdrom_gets_a_thin_overlay() {
            let mut model = sample_model();
            model.add_controller("ide", "ide0").unwrap();
            model
                .add_drive(
                    "cd0",
                    DriveMedia::Cdrom,
                    "/iso/install.iso",
                    DriveFormat::Raw,
                    None,
                    false,
                )
                .unwrap();
            model.attach("cd0", "ide0").unwrap();

            let cd = model.drive("cd0").unwrap();
            assert_eq!(cd.live_node(), "cd0-0");
            assert_eq!(cd.live_file(), Path::new("/pool/1/cd0-0.qcow2"));
        }

        #[test]
        fn snapshot_appends_one_overlay_per_drive() {
            let mut model = sample_model();
            let plans = model.take_snapshot("s1").unwrap();

            assert_eq!(plans.len(), 1);
            assert_eq!(plans[0].prev_node, "hd0");
            assert_eq!(plans[0].node_name, "hd0-1");
            assert_eq!(plans[0].file, Path::new("/pool/1/hd0-1.qcow2"));
            assert_eq!(model.drive("hd0").unwrap().live_node(), "hd0-1");
            assert_eq!(model.find_snapshot("s1").unwrap().sequence, 1);
        }

        #[test]
        fn snapshot_names_are_unique() {
            let mut model = sample_model();
            model.take_snapshot("s1").unwrap();
            assert!(model.take_snapshot("s1").is_err());
        }

        #[test]
        fn revert_drops_later_overlays_and_returns_files() {
            let mut model = sample_model();
            model.take_snapshot("s1").unwrap();
            model.take_snapshot("s2").unwrap();
            model.take_snapshot("s3").unwrap();

            let dropped = model.revert_to("s1").unwrap();
            assert_eq!(
                dropped,
                vec![
                    PathBuf::from("/pool/1/hd0-3.qcow2"),
                    PathBuf::from("/pool/1/hd0-2.qcow2"),
                ]
            );
            assert_eq!(model.snapshots().len(), 1);
            assert_eq!(model.drive("hd0").unwrap().live_node(), "hd0-1");
        }

        #[test]
        fn sequences_are_never_reused_after_revert() {
            let mut model = sample_model();
            model.take_snapshot("s1").unwrap();
            model.take_snapshot("s2").unwrap();
            model.revert_to("s1").unwrap();

            let plans = model.take_snapshot("s3").unwrap();
            assert_eq!(plans[0].node_name, "hd0-3");
            assert_eq!(model.find_snapshot("s3").unwrap().sequence, 3);
        }

        #[test]
        fn backing_node_tracks_the_chain() {
            let mut model = sample_model();
            model.take_snapshot("s1").unwrap();
            assert_eq!(model.drive("hd0").unwrap().backing_node(), "hd0");
            model.take_snapshot("s2").unwrap();
            assert_eq!(model.drive("hd0").unwrap().backing_node(), "hd0-1");
        }
    }

    mod capability {
        use super::*;

        #[test]
        fn nvme_disables_snapshots() {
            let mut model = BlockDevModel::new("/pool/1");
            model.add_controller("nvme", "nvme0").unwrap();
            model
                .add_drive(
                    "hd0",
                    DriveMedia::Disk,
                    "/pool/1/hd0.qcow2",
                    DriveFormat::Qcow2,
                    None,
                    false,
                )
                .unwrap();
            model.attach("hd0", "nvme0").unwrap();
            assert!(!model.supports_snapshots());
        }

        #[test]
        fn virtio_supports_snapshots() {
            assert!(sample_model().supports_snapshots());
        }
    }

    mod cmdline {
        use super::*;

        #[test]
        fn is_deterministic() {
            let model = sample_model();
            assert_eq!(model.gen_cmdline(), model.gen_cmdline());
        }

        #[test]
        fn emits_blockdev_chain_and_device() {
            let args = sample_model().gen_cmdline();
            let joined = args.join(" ");
            assert!(joined.contains(
                "driver=file,node-name=hd0-file,filename=/pool/1/hd0.qcow2"
            ));
            assert!(joined.contains("driver=qcow2,node-name=hd0,file=hd0-file"));
            assert!(joined.contains("virtio-blk,id=hd0-path0,drive=hd0"));
        }

        #[test]
        fn overlay_chain_references_backing_nodes() {
            let mut model = sample_model();
            model.take_snapshot("s1").unwrap();
            model.take_snapshot("s2").unwrap();
            let joined = model.gen_cmdline().join(" ");
            assert!(joined.contains("node-name=hd0-1,file=hd0-1-file,backing=hd0"));
            assert!(joined.contains("node-name=hd0-2,file=hd0-2-file,backing=hd0-1"));
            assert!(joined.contains("drive=hd0-2"));
        }

        #[test]
        fn scsi_devices_sit_on_their_bus() {
            let mut model = BlockDevModel::new("/pool/1");
            model.add_controller("virtio-scsi-pci", "scsi0").unwrap();
            model
                .add_drive(
                    "hd0",
                    DriveMedia::Disk,
                    "/pool/1/hd0.qcow2",
                    DriveFormat::Qcow2,
                    None,
                    false,
                )
                .unwrap();
            model.attach("hd0", "scsi0").unwrap();
            let joined = model.gen_cmdline().join(" ");
            assert!(joined.contains("-device virtio-scsi-pci,id=scsi0"));
            assert!(joined.contains("scsi-hd,id=hd0-path0,drive=hd0,bus=scsi0.0"));
        }

        #[test]
        fn secondary_paths_share_the_node() {
            let mut model = sample_model();
            model.add_controller("virtio-scsi-pci", "scsi1").unwrap();
            model.attach("hd0", "scsi1").unwrap();
            let joined = model.gen_cmdline().join(" ");
            assert!(joined.contains("scsi-hd,id=hd0-path1,drive=hd0,bus=scsi1.0,share-rw=on"));
        }

        #[test]
        fn pflash_uses_legacy_drive_syntax() {
            let mut model = BlockDevModel::new("/pool/1");
            model.add_controller(PFLASH_MODEL, "pflash").unwrap();
            model
                .add_drive(
                    "pflash-vars",
                    DriveMedia::Disk,
                    "/usr/share/OVMF/OVMF_VARS.fd",
                    DriveFormat::Raw,
                    None,
                    true,
                )
                .unwrap();
            model.attach("pflash-vars", "pflash").unwrap();
            let joined = model.gen_cmdline().join(" ");
            assert!(joined.contains(
                "-drive id=pflash-vars,if=pflash,unit=1,format=qcow2,file=/pool/1/pflash-vars-0.qcow2"
            ));
            assert!(!joined.contains("node-name=pflash-vars"));
        }
    }

    mod serialization {
        use super::*;

        #[test]
        fn roundtrip_preserves_everything() {
            let mut model = sample_model();
            model.add_controller("ide", "ide0").unwrap();
            model
                .add_drive(
                    "cd0",
                    DriveMedia::Cdrom,
                    "/iso/install.iso",
                    DriveFormat::Raw,
                    None,
                    false,
                )
                .unwrap();
            model.attach("cd0", "ide0").unwrap();
            model.take_snapshot("s1").unwrap();

            let restored = BlockDevModel::from_map(model.to_map().unwrap()).unwrap();
            assert_eq!(restored, model);
        }

        #[test]
        fn load_rejects_dangling_controller_reference() {
            let mut map = sample_model().to_map().unwrap();
            map["controllers"] = serde_json::json!([]);
            assert!(matches!(
                BlockDevModel::from_map(map),
                Err(Error::Config(_))
            ));
        }

        #[test]
        fn load_rejects_rewound_sequence_counter() {
            let mut model = sample_model();
            model.take_snapshot("s1").unwrap();
            let mut map = model.to_map().unwrap();
            map["next_sequence"] = serde_json::json!(1);
            assert!(matches!(
                BlockDevModel::from_map(map),
                Err(Error::Config(_))
            ));
        }
    }
}
