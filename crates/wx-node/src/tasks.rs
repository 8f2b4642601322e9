//! The task supervisor.
//!
//! A single-threaded outer state machine, driven from the main loop,
//! that schedules periodic observation collection and station clock
//! checks, assembles the POST body from the collector output plus the
//! persistent diagnostic state, drives the POST client, and tracks
//! consecutive-failure counters so the main loop can take the recovery
//! path when a threshold is reached.

use alloc::format;
use alloc::string::ToString;
use core::fmt::{self, Write};

use crate::bb::BB_BAD_POST_ERR_STR;
use crate::davis::{CollectStatus, Collector};
use crate::eeprom::ParamStore;
use crate::hal::{
    Board, ConsoleIn, DipSwitch, Led, LedColour, MonotonicClock, NetInterface, NvMemory,
    RetainedRam, SerialPort, WallClock,
};
use crate::lan::{LanCheckError, LanManager};
use crate::log::my_trace;
use crate::node::{station_id, Platform};
use crate::post::{PostClient, PostStatus};
use crate::report::{Flags, Reporter, Severity, Source};
use crate::timeout::SecsDeadline;
use crate::types::version_field;
use crate::report;

// Short-cut names for types of report output
const PROBLEM: Flags = Flags::new(Source::Tasks, Severity::PROBLEM);
const INFO: Flags = Flags::new(Source::Tasks, Severity::INFO);
const DETAIL: Flags = Flags::new(Source::Tasks, Severity::DETAIL);

const RAW_INFO: Flags = INFO.raw();

/// Console key that exits to the configuration menu.
pub const MENU_ESC: u8 = 0x1B;

/// Body buffer size the supervisor initialises the POST client with.
pub const POST_BODY_BUF_SIZE: usize = 2048;

// Timer values
const INIT_COLLECT_SECS: u32 = 30;
const FAST_COLLECT_SECS: u32 = 60;
const SLOW_COLLECT_SECS: u32 = 300;

const INIT_TIME_CHK_SECS: u32 = 120;
const BACKOFF_TIME_CHK_SECS: u32 = 300;
const NEXT_TIME_CHK_SECS: u32 = 86_400; // 24 * 60 * 60

/// Maximum number of seconds between updates.
pub const MAX_UPDATE_SECS: u16 = 3600;

// Maximum consecutive errors before a forced reset
const MAX_COLLECT_ERRS: u8 = 10;
const MAX_POST_ERRS: u8 = 10;

// The stored POST error has the state suffix appended; longer stored
// strings are replaced by the fixed substitute.
const MAX_STORED_ERR_LEN: usize = 64 - 15;

/// Internal states for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Idle,
    Collecting,
    Processing,
    Delivering,
    TimeChecking,
    TimeSetting,
}

/// Failures surfaced to the main loop for recovery dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// The POST client refused to start (permanent configuration error).
    PostStart,
    /// Physical Ethernet link lost.
    EthDown,
    /// IP interface or DHCP lease lost.
    LanDown,
    /// Too many consecutive collection failures.
    CollectFail,
    /// Too many consecutive POST failures.
    PostFail,
    /// Supervisor reached an impossible state.
    BadState,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            Self::PostStart => "POST start refused",
            Self::EthDown => "Ethernet link down",
            Self::LanDown => "LAN connection down",
            Self::CollectFail => "too many collection errors",
            Self::PostFail => "too many POST errors",
            Self::BadState => "bad state",
        };
        f.write_str(desc)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TaskError {}

/// Outcome of one supervisor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Keep calling.
    Ok,
    /// The operator asked for the configuration menu.
    Menu,
    Failed(TaskError),
}

/// Initialisation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TasksInitError {
    /// The stored POST parameter blocks are not all valid.
    EeInvalid,
    /// The stored server strings were rejected by the POST client.
    ServerConfig,
}

/// The supervisor state machine.
#[derive(Debug)]
pub struct Tasks {
    state: State,
    collect_tmr: SecsDeadline,
    time_chk_tmr: SecsDeadline,

    /// A collection result is queued for delivery.
    new_data: bool,
    collect_err_ctr: u8,
    post_err_ctr: u8,
}

impl Tasks {
    /// Sets up the schedule and binds the POST client to the stored
    /// server configuration. Call once at start-up, after the parameter
    /// store has been read.
    pub fn init<C, W, S, N, V, R, B, K, O>(
        post: &mut PostClient,
        store: &ParamStore,
        p: &mut Platform<C, W, S, N, V, R, B, K, O>,
    ) -> Result<Tasks, TasksInitError>
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
        let tasks = Tasks {
            state: State::Idle,
            collect_tmr: SecsDeadline::after(&p.clock, INIT_COLLECT_SECS),
            time_chk_tmr: SecsDeadline::after(&p.clock, INIT_TIME_CHK_SECS),
            new_data: false,
            collect_err_ctr: 0,
            post_err_ctr: 0,
        };

        if !store.post_valid {
            report!(p.rpt, PROBLEM, "EEPROM parameters for POST are invalid");
            p.board.set_led(Led::Post, LedColour::Red);
            return Err(TasksInitError::EeInvalid);
        }

        let bound = if store.post.use_proxy {
            post.set_server(
                store.host.as_str(),
                store.post.host_port,
                store.path.as_str(),
                Some((store.proxy.as_str(), store.post.proxy_port)),
            )
        } else {
            post.set_server(
                store.host.as_str(),
                store.post.host_port,
                store.path.as_str(),
                None,
            )
        };

        if bound.is_err() {
            report!(p.rpt, PROBLEM, "Stored server details rejected");
            p.board.set_led(Led::Post, LedColour::Red);
            return Err(TasksInitError::ServerConfig);
        }

        Ok(tasks)
    }

    /// Sets the timer for the next collection.
    ///
    /// The interval is the stored `update_secs` when it lies in
    /// `1..=3600`, otherwise the slow/fast DIP switch selects it.
    fn set_next_collection_time<C: MonotonicClock>(
        &mut self,
        clock: &C,
        store: &ParamStore,
        board: &impl Board,
        rpt: &mut Reporter<impl Write>,
    ) {
        let stored = store.unit.update_secs;

        let interval_secs = if (1..=MAX_UPDATE_SECS).contains(&stored) {
            stored as u32
        } else if board.dip(DipSwitch::SlowCollect) {
            SLOW_COLLECT_SECS
        } else {
            FAST_COLLECT_SECS
        };

        self.collect_tmr = SecsDeadline::after(clock, interval_secs);

        report!(
            rpt,
            INFO,
            "Next automatic collection in {} seconds (current time = {})",
            interval_secs,
            clock.seconds()
        );
    }

    /// Assembles the POST body for this attempt. Failures are reported
    /// but do not stop the attempt; the POST client sends whatever fits.
    fn set_post_body<C, W, S, N, V, R, B, K, O>(
        &mut self,
        collector: &Collector,
        post: &mut PostClient,
        store: &ParamStore,
        p: &mut Platform<C, W, S, N, V, R, B, K, O>,
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
        // Bump the sequence number for this attempt.
        let seq = p.retained.bump_seq();

        post.clear_body();

        let id = station_id(&store.unit, &p.board);
        if post.add_str("station", &id.to_string()).is_err() {
            report!(p.rpt, PROBLEM, "Could not add station ID to body");
            return;
        }

        // Exactly one of `data` or `sererr` is present.
        let added = if self.new_data {
            post.add_hex("data", collector.data())
        } else {
            post.add_str("sererr", collector.last_error())
        };
        if added.is_err() {
            report!(p.rpt, PROBLEM, "Could not add collected data to body");
            return;
        }

        if p.retained.post_error_pending() {
            let stored = p.retained.post_error_str();

            let posterr = if stored.len() >= MAX_STORED_ERR_LEN {
                BB_BAD_POST_ERR_STR.to_string()
            } else {
                format!("{} (state {})", stored, p.retained.post_error_state_num())
            };

            report!(p.rpt, DETAIL, "Previous POST error: {}", posterr);

            if post.add_str("posterr", &posterr).is_err() {
                report!(p.rpt, PROBLEM, "Could not add previous POST error to body");
                return;
            }
        }

        // Value is constrained to 0 to 2^31 - 1.
        let seq_masked = seq & 0x7FFF_FFFF;
        report!(p.rpt, DETAIL, "Sequence number: {}", seq_masked);
        if post.add_str("seq", &seq_masked.to_string()).is_err() {
            report!(p.rpt, PROBLEM, "Could not add sequence number to body");
            return;
        }

        let my_ip = LanManager::network_ip(&mut p.net);
        if post.add_hex("localip", &my_ip.octets()).is_err() {
            report!(p.rpt, PROBLEM, "Could not add local IP address to body");
            return;
        }

        if post.add_str("ver", &version_field()).is_err() {
            report!(p.rpt, PROBLEM, "Could not add firmware version to body");
        }
    }

    /// Main run routine which drives the supervisor, called repeatedly
    /// from the main loop.
    pub fn run<C, W, S, N, V, R, B, K, O>(
        &mut self,
        collector: &mut Collector,
        post: &mut PostClient,
        lan: &mut LanManager,
        store: &ParamStore,
        p: &mut Platform<C, W, S, N, V, R, B, K, O>,
    ) -> TaskStatus
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
        if lan.active {
            p.net.tick();
        }

        match self.state {
            // Waiting to initiate the next task
            State::Idle => {
                // Eat any stray serial bytes.
                let _ = collector.tick(&mut p.serial, &p.clock, &p.rtc, &mut p.board, &mut p.rpt);

                if self.collect_tmr.expired(&p.clock) {
                    report!(p.rpt, DETAIL, "Starting automatic data collection");
                    self.set_next_collection_time(&p.clock, store, &p.board, &mut p.rpt);
                    collector.start_collect(&mut p.serial, &p.clock, &mut p.board, &mut p.rpt);
                    self.state = State::Collecting;
                } else if self.time_chk_tmr.expired(&p.clock) {
                    // Limit the retry rate even when the check cannot run.
                    self.time_chk_tmr = SecsDeadline::after(&p.clock, BACKOFF_TIME_CHK_SECS);
                    if p.rtc.validated() {
                        collector.start_check_time(
                            &mut p.serial,
                            &p.clock,
                            &mut p.board,
                            &mut p.rpt,
                        );
                        report!(p.rpt, DETAIL, "Checking weather station clock");
                        self.state = State::TimeChecking;
                    } else {
                        report!(
                            p.rpt,
                            DETAIL,
                            "Cannot check weather station clock -- Interface clock not yet validated"
                        );
                    }
                } else {
                    // Not time for a collection yet.
                    p.board.refresh_switches();
                    p.rpt
                        .set_mode(store.unit.report_mode, p.board.dip(DipSwitch::VerboseReports));

                    match p.console.getc() {
                        None => {} // Nothing received

                        Some(MENU_ESC) => return TaskStatus::Menu,

                        Some(_) => {
                            report!(p.rpt, DETAIL, "Manually starting data collection");
                            self.set_next_collection_time(&p.clock, store, &p.board, &mut p.rpt);
                            collector.start_collect(
                                &mut p.serial,
                                &p.clock,
                                &mut p.board,
                                &mut p.rpt,
                            );
                            self.state = State::Collecting;
                        }
                    }

                    match lan.check_ok(&mut p.net, &mut p.board, &mut p.rpt) {
                        Ok(()) => {} // Connection okay
                        Err(LanCheckError::EthDown) => {
                            return TaskStatus::Failed(TaskError::EthDown);
                        }
                        Err(_) => return TaskStatus::Failed(TaskError::LanDown),
                    }
                }
            }

            // Collecting data from the weather station
            State::Collecting => {
                let status =
                    collector.tick(&mut p.serial, &p.clock, &p.rtc, &mut p.board, &mut p.rpt);

                if !status.is_pending() {
                    if status == CollectStatus::Success {
                        report!(p.rpt, DETAIL, "Data collected okay\x07");

                        self.new_data = true; // Mark data as collected
                        self.collect_err_ctr = 0;

                        collector.dump_data(&mut p.rpt);

                        self.state = State::Processing;
                    } else {
                        report!(p.rpt, PROBLEM, "Error collecting data\x07");

                        if !collector.data_valid() {
                            // The stale observation was overwritten.
                            self.new_data = false;
                        }

                        self.collect_err_ctr += 1;
                        if self.collect_err_ctr >= MAX_COLLECT_ERRS {
                            report!(p.rpt, PROBLEM, "Too many consecutive collection errors");
                            return TaskStatus::Failed(TaskError::CollectFail);
                        }

                        // Diagnostics still get delivered.
                        self.state = State::Processing;
                    }
                }
            }

            // Processing data into a POST request
            State::Processing => {
                let _ = collector.tick(&mut p.serial, &p.clock, &p.rtc, &mut p.board, &mut p.rpt);

                self.set_post_body(collector, post, store, p);

                report!(p.rpt, DETAIL, "Delivering data to remote server");

                if let Err(e) = post.start(&mut p.net, &mut p.board, &p.clock, &mut p.rpt) {
                    report!(p.rpt, PROBLEM, "POST start failed: {}", e);
                    return TaskStatus::Failed(TaskError::PostStart);
                }

                self.state = State::Delivering;
            }

            // Delivering data in a POST request
            State::Delivering => {
                let _ = collector.tick(&mut p.serial, &p.clock, &p.rtc, &mut p.board, &mut p.rpt);

                let status = post.tick(
                    &mut p.net,
                    &p.clock,
                    &mut p.rtc,
                    &mut p.board,
                    &mut p.rpt,
                    &mut p.retained,
                );

                if !status.is_pending() {
                    if status == PostStatus::Success {
                        report!(p.rpt, DETAIL, "Data delivered okay to remote server\x07");

                        self.new_data = false; // Mark data as delivered

                        p.retained.set_post_error_pending(false);

                        self.post_err_ctr = 0;
                    } else {
                        report!(p.rpt, PROBLEM, "Problem delivering data to remote server\x07");

                        p.retained.set_post_error_pending(true);

                        self.post_err_ctr += 1;
                        if self.post_err_ctr >= MAX_POST_ERRS {
                            report!(p.rpt, PROBLEM, "Too many consecutive POST errors");
                            return TaskStatus::Failed(TaskError::PostFail);
                        }

                        // Don't invalidate data -- allow the re-send.
                    }

                    report!(p.rpt, RAW_INFO, "\r\n");

                    lan.show_info(&mut p.net, &mut p.rpt, &store.lan, Severity::DETAIL);

                    report!(
                        p.rpt,
                        RAW_INFO,
                        "Press [ESC] to re-configure unit or other key for immediate collection\r\n"
                    );

                    self.state = State::Idle;
                }
            }

            // Checking the weather station clock against ours
            State::TimeChecking => {
                let status =
                    collector.tick(&mut p.serial, &p.clock, &p.rtc, &mut p.board, &mut p.rpt);

                if !status.is_pending() {
                    match status {
                        CollectStatus::Success => {
                            report!(p.rpt, DETAIL, "Weather station clock is set okay\x07");
                            self.time_chk_tmr =
                                SecsDeadline::after(&p.clock, NEXT_TIME_CHK_SECS);
                            self.state = State::Idle;
                        }

                        CollectStatus::WrongTime => {
                            if p.rtc.validated() {
                                collector.start_set_time(
                                    &mut p.serial,
                                    &p.clock,
                                    &mut p.board,
                                    &mut p.rpt,
                                );
                                report!(p.rpt, DETAIL, "Resetting weather station clock");
                                self.state = State::TimeSetting;
                            } else {
                                report!(
                                    p.rpt,
                                    DETAIL,
                                    "Cannot reset weather station clock -- Interface clock not yet validated"
                                );
                                self.state = State::Idle;
                            }
                        }

                        _ => {
                            report!(p.rpt, PROBLEM, "Error checking weather station clock\x07");
                            self.state = State::Idle;
                        }
                    }
                }
            }

            // Setting the weather station clock to match ours
            State::TimeSetting => {
                let status =
                    collector.tick(&mut p.serial, &p.clock, &p.rtc, &mut p.board, &mut p.rpt);

                if !status.is_pending() {
                    if status == CollectStatus::Success {
                        report!(p.rpt, DETAIL, "Weather station clock has been reset\x07");
                    } else {
                        report!(p.rpt, PROBLEM, "Error setting weather station clock\x07");
                    }
                    // The next scheduled check confirms either way.
                    self.state = State::Idle;
                }
            }
        }

        my_trace!("supervisor state {:?}", self.state);
        TaskStatus::Ok
    }

    /// Whether an observation is queued for (re-)delivery.
    pub fn new_data_flag(&self) -> bool {
        self.new_data
    }
}
