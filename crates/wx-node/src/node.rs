//! Main-loop glue: start-up sequencing, mode selection and recovery
//! dispatch.
//!
//! The host constructs a [`Platform`] from its HAL implementations,
//! boots a [`WxNode`], then drives `run` until it asks for the menu or
//! for a reset. Recovery is graded: network-adjacent failures pause (or
//! hold off the LAN) before the watchdog fires, so a misbehaving server
//! cannot make the unit thrash.

use core::fmt::{self, Write};

use crate::bb::Retained;
use crate::davis::Collector;
use crate::eeprom::{ParamStore, UnitConfig};
use crate::hal::{
    Board, ConsoleIn, DipSwitch, LedColour, MonotonicClock, NetInterface, NvMemory, RetainedRam,
    SerialPort, WallClock,
};
use crate::lan::{LanManager, LanStartError};
use crate::post::PostClient;
use crate::report::{Flags, Reporter, Severity, Source};
use crate::rtc::Rtc;
use crate::tasks::{TaskError, TaskStatus, Tasks, TasksInitError, MENU_ESC, POST_BODY_BUF_SIZE};
use crate::timeout::MsDeadline;
use crate::types::{HOST_NAME_PREFIX, VER_MAJOR, VER_MINOR};
use crate::report;

// Short-cut names for types of report output
const DETAIL: Flags = Flags::new(Source::Main, Severity::DETAIL);

const RAW_INFO: Flags = Flags::new(Source::Main, Severity::INFO).raw();

// Time constants
const LAMP_TEST_SECS: u32 = 1;
const MENU_PAUSE_SECS: u32 = 3;
const RESET_DELAY_SECS: u32 = 30;

/// Everything the firmware core needs from the platform, owned in one
/// place so the state machines can borrow the pieces they use.
pub struct Platform<C, W, S, N, V, R, B, K, O>
where
    C: MonotonicClock,
    W: WallClock,
    S: SerialPort,
    N: NetInterface,
    V: NvMemory,
    R: RetainedRam,
    B: Board,
    K: ConsoleIn,
    O: Write,
{
    pub clock: C,
    pub rtc: Rtc<W>,
    pub serial: S,
    pub net: N,
    pub nv: V,
    pub retained: Retained<R>,
    pub board: B,
    pub console: K,
    pub rpt: Reporter<O>,
}

/// How urgently the host must reset the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Reset right away.
    Immediate,
    /// Pause for the reset delay first (network may be up or down).
    Delayed,
    /// Run the LAN hold-off first (the network is down).
    LanHoldOff,
}

/// Why the main loop handed control back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeExit {
    /// The operator asked for the configuration menu.
    Menu,
    /// A failure requires a reset of the given kind.
    Reset(ResetKind),
}

/// Failure during `boot` or `start`; carries the required reset kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    Eeprom(ResetKind),
    Tasks(TasksInitError, ResetKind),
    Lan(LanStartError, ResetKind),
}

impl BootError {
    pub fn reset_kind(&self) -> ResetKind {
        match self {
            BootError::Eeprom(kind) | BootError::Tasks(_, kind) | BootError::Lan(_, kind) => *kind,
        }
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eeprom(_) => write!(f, "parameter store initialisation failed"),
            Self::Tasks(e, _) => write!(f, "task initialisation failed: {:?}", e),
            Self::Lan(e, _) => write!(f, "LAN start failed: {:?}", e),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for BootError {}

/// Weather station ID: stored base value plus rotary switch offset.
pub fn station_id(unit: &UnitConfig, board: &impl Board) -> u16 {
    unit.id_base.wrapping_add(board.rotary() as u16)
}

/// The assembled firmware core.
pub struct WxNode {
    pub store: ParamStore,
    pub collector: Collector,
    pub post: PostClient,
    pub lan: LanManager,
    pub tasks: Tasks,
}

impl WxNode {
    /// First boot stage: report the firmware version, run the lamp test
    /// and read the parameter store. Returns the store plus whether the
    /// operator asked for the menu during the invitation window.
    ///
    /// The battery-backed variables are expected to have been opened
    /// (validated) when the platform was assembled.
    pub fn boot<C, W, S, N, V, R, B, K, O>(
        p: &mut Platform<C, W, S, N, V, R, B, K, O>,
    ) -> Result<(ParamStore, bool), BootError>
    where
        C: MonotonicClock,
        W: WallClock,
        S: SerialPort,
        N: NetInterface,
        V: NvMemory,
        R: RetainedRam,
        B: Board,
        K: ConsoleIn,
        O: Write,
    {
        report!(
            p.rpt,
            DETAIL,
            "Firmware version number {}.{:02}",
            VER_MAJOR,
            VER_MINOR
        );

        p.board.refresh_switches();

        lamp_test(p);

        let store = match ParamStore::init(
            &mut p.nv,
            &p.clock,
            p.board.dip(DipSwitch::WriteDefaults),
            &mut p.rpt,
        ) {
            Ok(store) => store,
            Err(_) => {
                p.board.set_all_leds(LedColour::Red);
                return Err(BootError::Eeprom(ResetKind::Delayed));
            }
        };

        // Early reports ran on the DIP-selected mode; switch to the
        // stored selection now that it is known.
        p.rpt
            .set_mode(store.unit.report_mode, p.board.dip(DipSwitch::VerboseReports));

        let menu_requested = invite_menu(p);

        Ok((store, menu_requested))
    }

    /// Second boot stage: build the machines, bind the POST client to
    /// the stored configuration and bring the LAN up.
    pub fn start<C, W, S, N, V, R, B, K, O>(
        store: ParamStore,
        p: &mut Platform<C, W, S, N, V, R, B, K, O>,
    ) -> Result<WxNode, BootError>
    where
        C: MonotonicClock,
        W: WallClock,
        S: SerialPort,
        N: NetInterface,
        V: NvMemory,
        R: RetainedRam,
        B: Board,
        K: ConsoleIn,
        O: Write,
    {
        report!(p.rpt, DETAIL, "Initialising tasks...");

        let collector = Collector::init(&mut p.serial, &mut p.board);
        let mut post = PostClient::new(POST_BODY_BUF_SIZE);

        let tasks = Tasks::init(&mut post, &store, p)
            .map_err(|e| BootError::Tasks(e, ResetKind::Delayed))?;

        report!(p.rpt, DETAIL, "Initialising LAN interface...");

        let mut lan = LanManager::new();

        let host_name = dhcp_host_name(&store, &p.board);

        if let Err(e) = lan.start(
            &mut p.net,
            &p.clock,
            &mut p.board,
            &mut p.rpt,
            &store.lan,
            store.lan_valid,
            host_name.as_str(),
        ) {
            let kind = match e {
                LanStartError::EthDisconnected => ResetKind::Immediate,
                LanStartError::IfConfig | LanStartError::IfUp | LanStartError::IfUpTimeout => {
                    ResetKind::LanHoldOff
                }
                LanStartError::SockInit | LanStartError::InvalidParams => ResetKind::Delayed,
            };
            return Err(BootError::Lan(e, kind));
        }

        lan.show_info(&mut p.net, &mut p.rpt, &store.lan, Severity::INFO);

        report!(p.rpt, DETAIL, "Waiting for first data collection...");

        Ok(WxNode {
            store,
            collector,
            post,
            lan,
            tasks,
        })
    }

    /// Runs the supervisor until it needs the host: menu entry or a
    /// reset of some kind.
    pub fn run<C, W, S, N, V, R, B, K, O>(
        &mut self,
        p: &mut Platform<C, W, S, N, V, R, B, K, O>,
    ) -> NodeExit
    where
        C: MonotonicClock,
        W: WallClock,
        S: SerialPort,
        N: NetInterface,
        V: NvMemory,
        R: RetainedRam,
        B: Board,
        K: ConsoleIn,
        O: Write,
    {
        loop {
            match self.tasks.run(
                &mut self.collector,
                &mut self.post,
                &mut self.lan,
                &self.store,
                p,
            ) {
                TaskStatus::Ok => {}

                TaskStatus::Menu => return NodeExit::Menu,

                TaskStatus::Failed(e) => {
                    let kind = match e {
                        TaskError::EthDown | TaskError::CollectFail | TaskError::PostFail => {
                            ResetKind::Immediate
                        }
                        TaskError::LanDown => ResetKind::LanHoldOff,
                        TaskError::PostStart | TaskError::BadState => ResetKind::Delayed,
                    };
                    return NodeExit::Reset(kind);
                }
            }
        }
    }

    /// Carries out the pre-reset behaviour for the given kind. The host
    /// fires its watchdog when this returns.
    pub fn prepare_reset<C, W, S, N, V, R, B, K, O>(
        &mut self,
        p: &mut Platform<C, W, S, N, V, R, B, K, O>,
        kind: ResetKind,
    ) where
        C: MonotonicClock,
        W: WallClock,
        S: SerialPort,
        N: NetInterface,
        V: NvMemory,
        R: RetainedRam,
        B: Board,
        K: ConsoleIn,
        O: Write,
    {
        match kind {
            ResetKind::LanHoldOff => {
                report!(p.rpt, DETAIL, "Holding off LAN prior to reset...");
                self.lan.hold_off(&mut p.net, &p.clock, &mut p.board);
            }
            ResetKind::Delayed => {
                report!(p.rpt, DETAIL, "Pausing prior to reset...");
                pause_secs(p, RESET_DELAY_SECS, self.lan.active);
            }
            ResetKind::Immediate => {}
        }

        report!(p.rpt, DETAIL, "Resetting system...");
        pause_secs(p, 1, self.lan.active);
    }
}

/// Pauses while keeping the network stack serviced.
fn pause_secs<C, W, S, N, V, R, B, K, O>(
    p: &mut Platform<C, W, S, N, V, R, B, K, O>,
    secs: u32,
    net_active: bool,
) where
    C: MonotonicClock,
    W: WallClock,
    S: SerialPort,
    N: NetInterface,
    V: NvMemory,
    R: RetainedRam,
    B: Board,
    K: ConsoleIn,
    O: Write,
{
    let tout = crate::timeout::SecsDeadline::after(&p.clock, secs);

    while !tout.expired(&p.clock) {
        if net_active {
            p.net.tick();
        }
    }
}

/// Carries out the lamp test on start-up.
fn lamp_test<C, W, S, N, V, R, B, K, O>(p: &mut Platform<C, W, S, N, V, R, B, K, O>)
where
    C: MonotonicClock,
    W: WallClock,
    S: SerialPort,
    N: NetInterface,
    V: NvMemory,
    R: RetainedRam,
    B: Board,
    K: ConsoleIn,
    O: Write,
{
    p.board.set_all_leds(LedColour::Amber);
    pause_secs(p, LAMP_TEST_SECS, false);
    p.board.set_all_leds(LedColour::Off);
}

/// Invites the operator to enter the menu by pressing ESC within a few
/// seconds. True if ESC was pressed.
fn invite_menu<C, W, S, N, V, R, B, K, O>(p: &mut Platform<C, W, S, N, V, R, B, K, O>) -> bool
where
    C: MonotonicClock,
    W: WallClock,
    S: SerialPort,
    N: NetInterface,
    V: NvMemory,
    R: RetainedRam,
    B: Board,
    K: ConsoleIn,
    O: Write,
{
    let tout = MsDeadline::after(&p.clock, (MENU_PAUSE_SECS * 1000) as u16);

    report!(
        p.rpt,
        RAW_INFO,
        "Press [ESC] within {} seconds to re-configure unit\r\n",
        MENU_PAUSE_SECS
    );

    while !tout.expired(&p.clock) {
        if p.console.getc() == Some(MENU_ESC) {
            return true;
        }
    }

    false
}

/// Host name offered to the DHCP server: prefix plus station ID.
fn dhcp_host_name(store: &ParamStore, board: &impl Board) -> alloc::string::String {
    alloc::format!("{}{}", HOST_NAME_PREFIX, station_id(&store.unit, board))
}
