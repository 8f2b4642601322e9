//! The appliance binary: assembles the host platform, boots the firmware
//! core and supervises its resets.
//!
//! Configuration comes from the environment:
//!
//! - `WX_SERIAL_ADDR`  (required) host:port of the serial-over-TCP bridge
//!   in front of the weather station
//! - `WX_EEPROM_PATH`  parameter EEPROM image (default `wx-eeprom.bin`)
//! - `WX_RETAIN_PATH`  battery-backed image (default `wx-retain.bin`)
//! - `WX_DIP`, `WX_ROTARY`  see [`wx_node_host::EnvBoard`]
//!
//! The watchdog maps onto the process exit code; run under a supervisor
//! (systemd `Restart=always` or similar) to close the reset loop.

use std::path::PathBuf;
use std::process::ExitCode;

use wx_node::bb::Retained;
use wx_node::hal::Watchdog;
use wx_node::node::{NodeExit, Platform, WxNode};
use wx_node::report::Reporter;
use wx_node::rtc::Rtc;

use wx_node_host::{
    EnvBoard, FileNv, FileRetainedRam, HostClock, HostError, HostNet, HostWallClock, StdinConsole,
    StdoutConsole, TcpSerial,
};

/// Exit code the service supervisor treats as "reset requested".
const RESET_EXIT_CODE: u8 = 86;

struct ProcessWatchdog;

impl Watchdog for ProcessWatchdog {
    fn force_reset(&mut self) -> ! {
        std::process::exit(RESET_EXIT_CODE as i32);
    }
}

type HostPlatform = Platform<
    HostClock,
    HostWallClock,
    TcpSerial,
    HostNet,
    FileNv,
    FileRetainedRam,
    EnvBoard,
    StdinConsole,
    StdoutConsole,
>;

fn env_path(name: &'static str, default: &str) -> PathBuf {
    std::env::var_os(name)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn build_platform() -> Result<HostPlatform, HostError> {
    let serial_addr = std::env::var("WX_SERIAL_ADDR").map_err(|e| HostError::Env {
        name: "WX_SERIAL_ADDR",
        reason: e.to_string(),
    })?;

    let serial = TcpSerial::connect(&serial_addr)?;
    let nv = FileNv::open(&env_path("WX_EEPROM_PATH", "wx-eeprom.bin"))?;
    let retain = FileRetainedRam::open(&env_path("WX_RETAIN_PATH", "wx-retain.bin"))?;

    Ok(Platform {
        clock: HostClock::new(),
        rtc: Rtc::new(HostWallClock::new()),
        serial,
        net: HostNet::new(),
        nv,
        retained: Retained::open(retain),
        board: EnvBoard::from_env(),
        console: StdinConsole::spawn(),
        rpt: Reporter::new(StdoutConsole),
    })
}

fn main() -> ExitCode {
    env_logger::init();

    let mut platform = match build_platform() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("platform setup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut watchdog = ProcessWatchdog;

    let (store, menu_requested) = match WxNode::boot(&mut platform) {
        Ok(booted) => booted,
        Err(e) => {
            log::error!("boot failed: {}", e);
            // No node exists yet, so the pre-reset pause is skipped.
            watchdog.force_reset();
        }
    };

    if menu_requested {
        // The interactive configuration menu is not part of the core;
        // parameters are edited by writing the EEPROM image directly.
        println!("No configuration menu on this build; edit the EEPROM image instead.");
    }

    let mut node = match WxNode::start(store, &mut platform) {
        Ok(node) => node,
        Err(e) => {
            log::error!("start failed: {}", e);
            watchdog.force_reset();
        }
    };

    loop {
        match node.run(&mut platform) {
            NodeExit::Menu => {
                println!("No configuration menu on this build; edit the EEPROM image instead.");
            }
            NodeExit::Reset(kind) => {
                node.prepare_reset(&mut platform, kind);
                watchdog.force_reset();
            }
        }
    }
}
