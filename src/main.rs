use std::process::exit;

use clap::{Arg, ArgAction, Command};
use log::{error, info, warn, LevelFilter};

use canopend::gateway::CommandInterface;
use canopend::logging::{self, GatewayMirror};
use canopend::node::{NullStack, NODE_ID_LSS_UNCONFIGURED};
use canopend::runtime::{self, AppHooks, RuntimeConfig};
use canopend::storage::{region, Region, Storage, StorageAttr, StorageEntry};

/// Byte offsets inside the persisted mainline block: pending CAN bit rate
/// (little endian) and pending node-id.
const MAINLINE_BLOCK_LEN: usize = 4;
const MAINLINE_NODE_ID_OFFSET: usize = 2;

fn main() {
    exit(run());
}

fn run() -> i32 {
    let matches = Command::new("canopend")
        .about("CANopen runtime on Linux SocketCAN")
        .arg(
            Arg::new("device")
                .required(true)
                .help("CAN device name, e.g. can0"),
        )
        .arg(
            Arg::new("node-id")
                .short('i')
                .action(ArgAction::Set)
                .help("CANopen node-id (1..127) or 0xFF (LSS unconfigured)"),
        )
        .arg(
            Arg::new("rt-priority")
                .short('p')
                .allow_hyphen_values(true)
                .action(ArgAction::Set)
                .help("Realtime priority of the RT thread (1..99), -1 = default scheduler"),
        )
        .arg(
            Arg::new("reboot")
                .short('r')
                .action(ArgAction::SetTrue)
                .help("Reboot on CANopen NMT reset_node command"),
        )
        .arg(
            Arg::new("storage-prefix")
                .short('s')
                .action(ArgAction::Set)
                .help("Path and filename prefix for data storage files"),
        )
        .arg(
            Arg::new("command-interface")
                .short('c')
                .action(ArgAction::Set)
                .help("Command interface: \"stdio\", \"local-<file path>\" or \"tcp-<port>\""),
        )
        .arg(
            Arg::new("timeout")
                .short('T')
                .action(ArgAction::Set)
                .help("Socket timeout for the command interface in milliseconds, 0 = off"),
        )
        .try_get_matches();

    let matches = match matches {
        Ok(matches) => matches,
        Err(e) => {
            // also covers --help/--version, which are not failures
            let failure = !matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            );
            let _ = e.print();
            return if failure { 1 } else { 0 };
        }
    };

    let command_interface = match matches.get_one::<String>("command-interface") {
        None => CommandInterface::Disabled,
        Some(s) if s == "stdio" => CommandInterface::Stdio,
        Some(s) if s.starts_with("local-") => CommandInterface::Local(s["local-".len()..].into()),
        Some(s) if s.starts_with("tcp-") => match s["tcp-".len()..].parse::<u16>() {
            Ok(port) => CommandInterface::Tcp(port),
            Err(_) => {
                eprintln!("canopend: not a tcp port: {}", s);
                return 1;
            }
        },
        Some(s) => {
            eprintln!("canopend: unknown command interface: {}", s);
            return 1;
        }
    };

    let mirror = if command_interface != CommandInterface::Disabled {
        Some(GatewayMirror::new())
    } else {
        None
    };
    logging::init(LevelFilter::Debug, mirror.clone());

    let rt_priority = match matches.get_one::<String>("rt-priority") {
        None => None,
        Some(s) => match parse_number(s) {
            Some(-1) => None,
            Some(p) if (1..=99).contains(&p) => Some(p as i32),
            _ => {
                error!("invalid realtime priority: {}", s);
                return 1;
            }
        },
    };

    let gateway_timeout_ms = match matches.get_one::<String>("timeout") {
        None => 0,
        Some(s) => match parse_number(s) {
            Some(t) if t >= 0 && t <= u32::MAX as i64 => t as u32,
            _ => {
                error!("invalid socket timeout: {}", s);
                return 1;
            }
        },
    };

    // the mainline block (pending bit rate and node-id) persists across
    // restarts and may be updated by LSS configuration
    let mut mainline_default = vec![0u8; MAINLINE_BLOCK_LEN];
    mainline_default[MAINLINE_NODE_ID_OFFSET] = NODE_ID_LSS_UNCONFIGURED;
    let mainline: Region = region(mainline_default);

    let mut storage = Storage::new(vec![StorageEntry::new(
        "mainline.persist",
        mainline.clone(),
        4,
        StorageAttr::CMD | StorageAttr::AUTO | StorageAttr::RESTORE,
    )]);
    if let Some(prefix) = matches.get_one::<String>("storage-prefix") {
        storage.apply_prefix(prefix);
    }
    let storage_init_error = match storage.load() {
        Ok(bitmap) => {
            if bitmap != 0 {
                warn!("storage degraded, defaults in use (bitmap {:#x})", bitmap);
            }
            bitmap
        }
        Err(e) => {
            error!("storage initialization failed: {}", e);
            return 1;
        }
    };

    // node-id: argument wins over the persisted pending value
    let mut node_id = mainline.lock().unwrap()[MAINLINE_NODE_ID_OFFSET];
    if let Some(s) = matches.get_one::<String>("node-id") {
        node_id = match parse_number(s) {
            Some(v) if (1..=127).contains(&v) => v as u8,
            Some(v) if v == NODE_ID_LSS_UNCONFIGURED as i64 => NODE_ID_LSS_UNCONFIGURED,
            _ => {
                error!("invalid node-id: {} (want 1..127 or 0xFF)", s);
                return 1;
            }
        };
    }
    if node_id < 1 || node_id > 127 {
        node_id = NODE_ID_LSS_UNCONFIGURED;
    }
    mainline.lock().unwrap()[MAINLINE_NODE_ID_OFFSET] = node_id;

    let device = matches
        .get_one::<String>("device")
        .cloned()
        .unwrap_or_default();

    let config = RuntimeConfig {
        device: device.clone(),
        node_id,
        rt_priority,
        reboot_on_app_reset: matches.get_flag("reboot"),
        command_interface,
        gateway_timeout_ms,
        log_mirror: mirror,
        ..Default::default()
    };

    info!("{}: node-id {:#04x}", device, node_id);

    match runtime::run(
        config,
        NullStack::new(node_id),
        storage,
        storage_init_error,
        AppHooks::default(),
    ) {
        Ok(()) => 0,
        Err(e) => {
            error!("{}: {}", device, e);
            1
        }
    }
}

/// Integer parsing with the usual C notation: decimal or 0x-prefixed hex,
/// optional sign.
fn parse_number(s: &str) -> Option<i64> {
    let t = s.trim();
    let (negative, t) = if let Some(stripped) = t.strip_prefix('-') {
        (true, stripped)
    } else {
        (false, t)
    };
    let value = if t.starts_with("0x") || t.starts_with("0X") {
        i64::from_str_radix(&t[2..], 16).ok()?
    } else {
        t.parse::<i64>().ok()?
    };
    Some(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_notation() {
        assert_eq!(parse_number("4"), Some(4));
        assert_eq!(parse_number("0xFF"), Some(255));
        assert_eq!(parse_number("0x7f"), Some(127));
        assert_eq!(parse_number("-1"), Some(-1));
        assert_eq!(parse_number("junk"), None);
        assert_eq!(parse_number(""), None);
    }
}
