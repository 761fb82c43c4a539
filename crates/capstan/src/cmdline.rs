//! QEMU argv construction from a frozen [`VmConfig`] and the block-device
//! model. Deterministic: the same inputs always produce the same argv.

use crate::blockdev::BlockDevModel;
use capstan_core::{Arch, Error, Firmware, NicKind, Result, VmConfig};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};

/// OVMF firmware locations probed in order when the config does not pin
/// one. The vars template is derived from the code path.
pub const OVMF_CANDIDATES: &[&str] = &[
    "/usr/share/qemu/ovmf-x86_64-ms-code.bin",
    "/usr/share/qemu/ovmf-x86_64-code.bin",
    "/usr/share/qemu/ovmf-x86_64.bin",
    "/usr/share/OVMF/OVMF_CODE.fd",
    "/usr/share/edk2/ovmf/OVMF_CODE.fd",
];

/// VNC share policy, both spellings: `share=` goes into the qemu argv,
/// `sharePolicy=` is what clients templating libvirt domains expect.
pub const VNC_SHARE_POLICY: &str = "force-shared";

pub fn qemu_binary(arch: Arch) -> String {
    let name = arch.qemu_binary();
    which::which(name)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| name.to_string())
}

/// Resolve firmware paths that were left for discovery. Returns the
/// firmware with concrete paths filled in; the caller reports these to
/// the parent instead of mutating shared state mid-run.
pub fn resolve_firmware(config: &VmConfig) -> Result<Firmware> {
    resolve_firmware_from(config, OVMF_CANDIDATES)
}

pub fn resolve_firmware_from(config: &VmConfig, candidates: &[&str]) -> Result<Firmware> {
    match &config.firmware {
        Firmware::UefiSplit { code, vars } => {
            let code = match code {
                Some(code) => code.clone(),
                None => {
                    if config.arch != Arch::X86_64 {
                        return Err(Error::Config(
                            "UEFI firmware discovery is only wired up for x86_64".into(),
                        ));
                    }
                    candidates
                        .iter()
                        .map(PathBuf::from)
                        .find(|p| p.exists())
                        .ok_or_else(|| {
                            Error::Config("no OVMF firmware found on this host".into())
                        })?
                }
            };
            let vars = match vars {
                Some(vars) => vars.clone(),
                None => derive_vars_path(&code).ok_or_else(|| {
                    Error::Config(format!(
                        "cannot derive a vars file from '{}'",
                        code.display()
                    ))
                })?,
            };
            Ok(Firmware::UefiSplit {
                code: Some(code),
                vars: Some(vars),
            })
        }
        other => Ok(other.clone()),
    }
}

/// `code` -> `vars` substitution on the file name, both spellings.
fn derive_vars_path(code: &Path) -> Option<PathBuf> {
    let name = code.file_name()?.to_str()?;
    let replaced = if name.contains("code") {
        name.replace("code", "vars")
    } else if name.contains("CODE") {
        name.replace("CODE", "VARS")
    } else {
        return None;
    };
    Some(code.with_file_name(replaced))
}

/// Full QEMU argv (binary at index 0). `firmware` must already be
/// resolved; `incoming` adds the deferred-incoming flag used when
/// restoring a snapshot.
pub fn build_argv(
    config: &VmConfig,
    model: &BlockDevModel,
    firmware: &Firmware,
    snapshots_supported: bool,
    incoming: bool,
) -> Result<(Vec<String>, Value)> {
    let mut argv = vec![qemu_binary(config.arch)];
    let mut discovered = json!({});

    // Startup gating: qemu waits for an explicit cont after the QMP
    // handshake.
    argv.push("-S".into());
    argv.push("-no-shutdown".into());
    if snapshots_supported {
        argv.push("-only-migratable".into());
    }

    if let Some(machine) = machine_argument(config) {
        argv.push("-machine".into());
        argv.push(machine);
    }
    argv.push("-m".into());
    argv.push(config.ram_mb.to_string());
    argv.push("-smp".into());
    argv.push(config.cpus.to_string());
    if let Some(boot) = &config.boot {
        argv.push("-boot".into());
        argv.push(boot.clone());
    }

    match firmware {
        Firmware::Bios => {}
        Firmware::UefiSingle { image } => {
            argv.push("-bios".into());
            argv.push(image.display().to_string());
        }
        Firmware::UefiSplit { code, vars } => {
            let code = code
                .as_ref()
                .ok_or_else(|| Error::Config("unresolved UEFI code path".into()))?;
            argv.push("-drive".into());
            argv.push(format!(
                "if=pflash,format=raw,unit=0,readonly=on,file={}",
                code.display()
            ));
            discovered["ovmf_code"] = json!(code.display().to_string());
            if let Some(vars) = vars {
                discovered["ovmf_vars"] = json!(vars.display().to_string());
            }
            // The writable vars flash is a model drive ("pflash-vars") so
            // it participates in snapshots; gen_cmdline emits it.
        }
    }

    display_arguments(config, &mut argv)?;

    argv.push("-vnc".into());
    argv.push(format!(":{},share={VNC_SHARE_POLICY}", config.worker_id));

    if let Some(audio) = &config.audio {
        if config.qemu_at_least(4, 2) {
            argv.push("-audiodev".into());
            argv.push(format!("{},id={}", audio.backend, audio.id));
            argv.push("-device".into());
            argv.push("intel-hda".into());
            argv.push("-device".into());
            argv.push(format!("hda-output,audiodev={}", audio.id));
        } else {
            argv.push("-device".into());
            argv.push("intel-hda".into());
            argv.push("-device".into());
            argv.push("hda-output".into());
        }
    }

    let mut macs = Vec::new();
    for (index, nic) in config.nics.iter().enumerate() {
        let netdev_id = format!("qanet{index}");
        let netdev = match &nic.kind {
            NicKind::User => format!("user,id={netdev_id}"),
            NicKind::Tap { ifname, script } => {
                let script = script
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "no".to_string());
                format!("tap,id={netdev_id},ifname={ifname},script={script},downscript=no")
            }
            NicKind::Vde { sock, port } => {
                let mut line = format!("vde,id={netdev_id},sock={}", sock.display());
                if let Some(port) = port {
                    line.push_str(&format!(",port={port}"));
                }
                line
            }
        };
        let mac = nic.effective_mac(config.worker_id, index);
        argv.push("-netdev".into());
        argv.push(netdev);
        argv.push("-device".into());
        argv.push(format!("{},netdev={netdev_id},mac={mac}", nic.model));
        macs.push(mac);
    }
    discovered["macs"] = json!(macs);

    // serial0 is always a ringbuf chardev logging to a file next to the
    // pid file (qemu runs with the pool directory as cwd).
    argv.push("-chardev".into());
    argv.push("ringbuf,id=serial0,logfile=serial0,logappend=on".into());
    argv.push("-serial".into());
    argv.push("chardev:serial0".into());

    if config.virtio_consoles > 0 {
        argv.push("-device".into());
        argv.push("virtio-serial".into());
        for index in 0..config.virtio_consoles {
            let name = console_name(index);
            argv.push("-chardev".into());
            argv.push(format!("pipe,id={name},path={name}"));
            argv.push("-device".into());
            argv.push(format!("virtconsole,chardev={name}"));
        }
    }

    if let Some(tpm) = &config.tpm {
        let device = match config.arch {
            Arch::X86_64 => "tpm-tis",
            Arch::Aarch64 => "tpm-tis-device",
            Arch::Ppc64 => "tpm-spapr",
        };
        argv.push("-chardev".into());
        argv.push(format!("socket,id=chrtpm,path={}", tpm.socket.display()));
        argv.push("-tpmdev".into());
        argv.push("emulator,id=tpm0,chardev=chrtpm".into());
        argv.push("-device".into());
        argv.push(format!("{device},tpmdev=tpm0"));
    }

    argv.push("-chardev".into());
    argv.push("socket,id=qmp_socket,path=qmp_socket,server,nowait".into());
    argv.push("-qmp".into());
    argv.push("chardev:qmp_socket".into());

    argv.extend(model.gen_cmdline());

    if incoming {
        argv.push("-incoming".into());
        argv.push("defer".into());
    }

    Ok((argv, discovered))
}

fn machine_argument(config: &VmConfig) -> Option<String> {
    let base = config
        .machine
        .clone()
        .or_else(|| config.arch.default_machine().map(str::to_string));
    let mut machine = base?;
    // spapr firmware assist is broken on these, qemu refuses to start
    // without the downgraded capabilities
    if config.arch == Arch::Ppc64 && config.qemu_at_least(4, 0) {
        machine.push_str(",cap-cfpc=broken,cap-sbbc=broken,cap-ibs=broken");
    }
    Some(machine)
}

fn display_arguments(config: &VmConfig, argv: &mut Vec<String>) -> Result<()> {
    match config.arch {
        Arch::Aarch64 => {
            let gpu = config.vga.clone().unwrap_or_else(|| "virtio-gpu-pci".into());
            argv.push("-device".into());
            argv.push(gpu);
            // no PS/2 nor ISA FDC on virt machines, input goes over USB
            argv.push("-device".into());
            argv.push("qemu-xhci".into());
            argv.push("-device".into());
            argv.push("usb-kbd".into());
            argv.push("-device".into());
            argv.push("usb-tablet".into());
        }
        Arch::Ppc64 => {
            let vga = config.vga.clone().unwrap_or_else(|| "std".into());
            if vga != "std" && vga != "cirrus" {
                return Err(Error::Config(format!(
                    "unsupported VGA mode '{vga}' for OFW machines"
                )));
            }
            argv.push("-vga".into());
            argv.push(vga);
        }
        Arch::X86_64 => {
            argv.push("-vga".into());
            argv.push(config.vga.clone().unwrap_or_else(|| "std".into()));
        }
    }
    Ok(())
}

/// Chardev id of the Nth virtio console; its fifos live next to the
/// qmp socket as `<name>.in` / `<name>.out`.
pub fn console_name(index: u32) -> String {
    if index == 0 {
        "virtio_console".to_string()
    } else {
        format!("virtio_console{index}")
    }
}
