//! Block-device model properties over the public API: serialization
//! round-trips and overlay-chain stability across a save/revert cycle.

use capstan::BlockDevModel;
use capstan_core::{DriveFormat, DriveMedia};

fn two_drive_model() -> BlockDevModel {
    let mut model = BlockDevModel::new("/pool/9");
    model.add_controller("virtio-scsi-pci", "scsi0").unwrap();
    model
        .add_drive(
            "hd0",
            DriveMedia::Disk,
            "/pool/9/hd0.qcow2",
            DriveFormat::Qcow2,
            Some(20 << 30),
            false,
        )
        .unwrap();
    model.attach("hd0", "scsi0").unwrap();
    model
        .add_drive(
            "cd0",
            DriveMedia::Cdrom,
            "/iso/leap.iso",
            DriveFormat::Raw,
            None,
            false,
        )
        .unwrap();
    model.attach("cd0", "scsi0").unwrap();
    model
}

#[test]
fn map_roundtrip_is_lossless() {
    let mut model = two_drive_model();
    model.take_snapshot("base").unwrap();
    model.take_snapshot("patched").unwrap();

    let restored = BlockDevModel::from_map(model.to_map().unwrap()).unwrap();
    assert_eq!(restored, model);
    assert_eq!(restored.gen_cmdline(), model.gen_cmdline());
}

#[test]
fn chain_after_revert_equals_chain_at_save_time() {
    let mut model = two_drive_model();
    model.take_snapshot("s1").unwrap();
    let chain_at_save: Vec<_> = model
        .drive("hd0")
        .unwrap()
        .overlays
        .iter()
        .map(|overlay| overlay.node_name.clone())
        .collect();

    // guest "mutates" further history
    model.take_snapshot("noise1").unwrap();
    model.take_snapshot("noise2").unwrap();
    model.revert_to("s1").unwrap();

    let chain_after_load: Vec<_> = model
        .drive("hd0")
        .unwrap()
        .overlays
        .iter()
        .map(|overlay| overlay.node_name.clone())
        .collect();
    assert_eq!(chain_after_load, chain_at_save);
}

#[test]
fn cdrom_overlays_keep_the_base_image_pristine_in_argv() {
    let model = two_drive_model();
    let joined = model.gen_cmdline().join(" ");

    // the iso is only referenced as a read-through backing file node
    assert!(joined.contains("driver=file,node-name=cd0-file,filename=/iso/leap.iso"));
    assert!(joined.contains("node-name=cd0-0,file=cd0-0-file,backing=cd0"));
    assert!(joined.contains("scsi-cd,id=cd0-path0,drive=cd0-0"));
}
