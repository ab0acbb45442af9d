//! QEMU command-line construction.
//!
//! [`build_args`] is a pure function of [`VmConfig`]: no I/O, no validation.
//! Path existence is checked by the supervisor before it ever calls in here.

use crate::vm::VmConfig;

/// TCG settings shared by both acceleration variants.
const TCG_ACCEL: &str = "tcg,thread=multi,tb-size=1024";

/// Number of spicevmc USB redirection channels attached to the guest.
const USB_REDIR_CHANNELS: usize = 3;

/// Build the argument vector (without the program name) for `qemu-system-*`.
///
/// Order is fixed: machine, QMP, CPU topology, memory, disk, USB, network,
/// optional CD-ROM, display, acceleration, audio/video defaults, name, boot
/// menu.
pub fn build_args(config: &VmConfig) -> Vec<String> {
    let mut args: Vec<String> = Vec::with_capacity(64);

    // Machine type.
    push(&mut args, "-machine", "q35,vmport=off,i8042=off");

    // Management protocol.
    push(
        &mut args,
        "-qmp",
        format!("tcp:127.0.0.1:{},server,nowait", config.qmp_port),
    );

    // Resources.
    push(
        &mut args,
        "-smp",
        format!(
            "cpus={n},sockets=1,cores={n},threads=1",
            n = config.cpu_count
        ),
    );
    push(&mut args, "-m", config.memory_mb.to_string());

    // Primary disk.
    push(&mut args, "-device", "ide-hd,bus=ide.1,drive=drive0,bootindex=1");
    push(
        &mut args,
        "-drive",
        format!(
            "if=none,media=disk,id=drive0,file={},discard=unmap,detect-zeroes=unmap",
            escape_opt(&config.disk_image_path.display().to_string())
        ),
    );

    push_usb(&mut args);

    // Network.
    push(
        &mut args,
        "-device",
        format!("e1000,mac={},netdev=net0", escape_opt(&config.mac_address)),
    );
    push(&mut args, "-netdev", "user,id=net0");

    // Installation medium.
    if !config.skip_cdrom {
        let cdrom = config
            .cdrom_image_path
            .as_ref()
            .map(|p| escape_opt(&p.display().to_string()))
            .unwrap_or_default();
        push(&mut args, "-device", "ide-cd,bus=ide.0,drive=cdrom0,bootindex=0");
        push(
            &mut args,
            "-drive",
            format!("if=none,media=cdrom,id=cdrom0,file={cdrom}"),
        );
    }

    if config.use_sdl_display {
        push(&mut args, "-display", "sdl");
    }

    if config.use_hardware_accel {
        push(&mut args, "-accel", "hax");
    }
    push(&mut args, "-accel", TCG_ACCEL);

    // Audio / video.
    args.push("-nodefaults".to_string());
    push(&mut args, "-vga", "none");
    push(&mut args, "-device", "virtio-vga");
    push(&mut args, "-device", "intel-hda");
    push(&mut args, "-device", "hda-duplex");

    push(&mut args, "-name", escape_opt(&config.name));
    push(&mut args, "-boot", "menu=on");

    args
}

/// Tablet/mouse/keyboard on the default bus, an ICH9 EHCI controller with its
/// three UHCI companions, and the spicevmc redirection channels.
fn push_usb(args: &mut Vec<String>) {
    args.push("-usb".to_string());
    push(args, "-device", "usb-tablet,bus=usb-bus.0");
    push(args, "-device", "usb-mouse,bus=usb-bus.0");
    push(args, "-device", "usb-kbd,bus=usb-bus.0");
    push(args, "-device", "ich9-usb-ehci1,id=usb-controller-0");
    for (i, first_port) in [0, 2, 4].into_iter().enumerate() {
        push(
            args,
            "-device",
            format!(
                "ich9-usb-uhci{},masterbus=usb-controller-0.0,firstport={first_port},multifunction=on",
                i + 1
            ),
        );
    }
    for i in 0..USB_REDIR_CHANNELS {
        push(
            args,
            "-chardev",
            format!("spicevmc,name=usbredir,id=usbredirchardev{i}"),
        );
        push(
            args,
            "-device",
            format!(
                "usb-redir,chardev=usbredirchardev{i},id=usbredirdev{i},bus=usb-controller-0.0"
            ),
        );
    }
}

/// Escape a value embedded in a QEMU `key=value,...` option string, where a
/// literal comma is written `,,`.
fn escape_opt(value: &str) -> String {
    value.replace(',', ",,")
}

fn push(args: &mut Vec<String>, flag: &str, value: impl Into<String>) {
    args.push(flag.to_string());
    args.push(value.into());
}

/// Render a program and its arguments as a single copy-pasteable line.
/// Any argument with a character outside the shell-safe set is single-quoted.
pub fn render(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(quote)
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote(arg: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c);
    if !arg.is_empty() && arg.chars().all(safe) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
