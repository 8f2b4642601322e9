//! Data collection from the Davis Instruments weather station.
//!
//! A complete definition of the protocol can be found in the Davis
//! Instruments document "Vantage Pro and Vantage Pro2 Serial Support"
//! (this code is based on Issue 2.2 dated 01-25-2005).
//!
//! The collector is a cooperative state machine driven by `tick`. A
//! command starts with the wakeup handshake (send `'\n'`, expect
//! `"\n\r"`), then the ASCII command line; depending on the command the
//! station answers with an ACK byte, an OK string, a 99-byte LOOP packet
//! or an 8-byte time packet, the binary payloads carrying a big-endian
//! CCITT-16 checksum.

use alloc::format;
use alloc::string::String;
use core::fmt::{self, Write};

use chrono::{DateTime, Datelike, NaiveDate, Timelike};

use crate::crc::crc_calculate;
use crate::hal::{Board, Led, LedColour, MonotonicClock, SerialPort, WallClock};
use crate::log::my_trace;
use crate::report::{Flags, Reporter, Severity, Source};
use crate::rtc::Rtc;
use crate::timeout::{MsDeadline, SecsDeadline};
use crate::report;

// Short-cut names for types of report output
const PROBLEM: Flags = Flags::new(Source::Davis, Severity::PROBLEM);
const INFO: Flags = Flags::new(Source::Davis, Severity::INFO);
const DETAIL: Flags = Flags::new(Source::Davis, Severity::DETAIL);

const RAW_INFO: Flags = INFO.raw();
const RAW_DETAIL: Flags = DETAIL.raw();

/// Length of the binary LOOP 1 observation packet.
pub const DAV_DATA_LEN: usize = 99;

// Positions of various elements in the binary data buffer
const DAV_DATA_BAR_L: usize = 7;
const DAV_DATA_BAR_H: usize = 8;
const DAV_DATA_IN_TEMP_L: usize = 9;
const DAV_DATA_IN_TEMP_H: usize = 10;
const DAV_DATA_OUT_TEMP_L: usize = 12;
const DAV_DATA_OUT_TEMP_H: usize = 13;
const DAV_DATA_WIND_SPEED: usize = 14;
const DAV_DATA_WIND_DIR_L: usize = 16;
const DAV_DATA_WIND_DIR_H: usize = 17;
const DAV_DATA_LF: usize = 95;
const DAV_DATA_CR: usize = 96;
const DAV_DATA_CRC_H: usize = 97;
const DAV_DATA_CRC_L: usize = 98;

// Special characters and strings used in data exchange
const DAV_ACK: u8 = 0x06;
const DAV_NAK: u8 = 0x21;
const DAV_OK_RESP: &[u8] = b"\n\rOK\n\r";

// Time buffer layout
const DAV_TIME_LEN: usize = 8;
const DAV_TIME_SEC: usize = 0;
const DAV_TIME_MIN: usize = 1;
const DAV_TIME_HOUR: usize = 2;
const DAV_TIME_DAY: usize = 3;
const DAV_TIME_MONTH: usize = 4;
const DAV_TIME_YEAR: usize = 5;
const DAV_TIME_CRC_H: usize = 6;
const DAV_TIME_CRC_L: usize = 7;

/// Number of seconds before the overall command timeout.
const TIMEOUT_SECS: u32 = 20;

// Retry counts and timeouts for responses at individual stages
const MAX_WAKEUP_ATTEMPTS: u8 = 5;

const MAX_WAKEUP_MS: u16 = 1200;
const MAX_RESP_MS: u16 = 2000;
const MAX_DATA_MS: u16 = 2000;
const MAX_ECHO_MS: u16 = 1000;
const MAX_TIME_MS: u16 = 2000;

/// Maximum allowed difference before the station clock counts as wrong.
const MAX_DIFF_SECS: u32 = 30;

/// Internal states for the data collection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Idle,
    Starting,
    AwaitingLf,
    AwaitingCr,
    AwaitingAck,
    AwaitingData,
    CheckingData,
    AwaitingOk,
    EchoingResp,
    AwaitingTime,
}

/// Valid command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdId {
    Collect,
    SetBar,
    EchoResp,
    ChkTime,
    SetTime,
    /// SETTIME follow-up: the time packet itself is acknowledged.
    ExpectAck,
}

/// Hard failure kinds from the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectError {
    NotStarted,
    SerialErr,
    Timeout,
    Aborted,
    NoWakeup,
    BadWakeup,
    NoAck,
    NegAck,
    BadAck,
    NoData,
    BadData,
    BadCrc,
    NoTime,
    BadTime,
    BadState,
}

impl fmt::Display for CollectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            Self::NotStarted => "not started",
            Self::SerialErr => "serial port error",
            Self::Timeout => "timed out",
            Self::Aborted => "aborted",
            Self::NoWakeup => "no wakeup response",
            Self::BadWakeup => "bad wakeup response",
            Self::NoAck => "no acknowledgement",
            Self::NegAck => "negative acknowledgement",
            Self::BadAck => "bad acknowledgement",
            Self::NoData => "no data received",
            Self::BadData => "malformed data",
            Self::BadCrc => "data CRC mismatch",
            Self::NoTime => "no time received",
            Self::BadTime => "time CRC mismatch",
            Self::BadState => "bad state",
        };
        f.write_str(desc)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CollectError {}

/// Overall status of the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectStatus {
    /// Command still in progress.
    Pending,
    /// Command completed.
    Success,
    /// GETTIME completed, but the station clock disagrees with ours.
    /// This is a distinguished result, not a failure.
    WrongTime,
    Failed(CollectError),
}

impl CollectStatus {
    pub fn is_pending(self) -> bool {
        self == CollectStatus::Pending
    }

    /// Integer form of the status: 0 pending, positive terminal success,
    /// negative error kind. Kept for interfaces that rely on the sign
    /// convention.
    pub fn code(self) -> i8 {
        match self {
            Self::Pending => 0,
            Self::Success => 1,
            Self::WrongTime => 2,
            Self::Failed(e) => match e {
                CollectError::NotStarted => -1,
                CollectError::SerialErr => -2,
                CollectError::Timeout => -3,
                CollectError::Aborted => -4,
                CollectError::NoWakeup => -5,
                CollectError::BadWakeup => -6,
                CollectError::NoAck => -7,
                CollectError::NegAck => -8,
                CollectError::BadAck => -9,
                CollectError::NoData => -10,
                CollectError::BadData => -11,
                CollectError::BadCrc => -12,
                CollectError::NoTime => -13,
                CollectError::BadTime => -14,
                CollectError::BadState => -15,
            },
        }
    }
}

/// Outcome of the dispatch that follows an ACK or OK response.
enum Dispatch {
    Done,
    Continue,
}

/// The data collection state machine.
pub struct Collector {
    state: State,
    condition: CollectStatus,

    timeout: SecsDeadline,

    cmd_id: CmdId,
    cmd: String,

    attempt_count: u8,
    resp_tout: MsDeadline,

    parm1: i32,
    parm2: i32,

    data: [u8; DAV_DATA_LEN],
    data_valid: bool,

    time_buf: [u8; DAV_TIME_LEN],

    error_str: &'static str,
}

impl Collector {
    /// Builds the collector and enables the handshake lines towards the
    /// station. Call once at start-up, after the host has opened the
    /// serial port (19,200 bps 8N1).
    pub fn init(serial: &mut impl SerialPort, board: &mut impl Board) -> Self {
        board.set_dtr(true);
        board.set_rts(true);

        serial.flush_output();
        serial.flush_input();

        Collector {
            state: State::Idle,
            condition: CollectStatus::Failed(CollectError::NotStarted),
            timeout: SecsDeadline::default(),
            cmd_id: CmdId::Collect,
            cmd: String::new(),
            attempt_count: 0,
            resp_tout: MsDeadline::default(),
            parm1: 0,
            parm2: 0,
            data: [0; DAV_DATA_LEN],
            data_valid: false,
            time_buf: [0; DAV_TIME_LEN],
            error_str: "Not started",
        }
    }

    /// Starts the LOOP 1 observation collection.
    pub fn start_collect(
        &mut self,
        serial: &mut impl SerialPort,
        clock: &impl MonotonicClock,
        board: &mut impl Board,
        rpt: &mut Reporter<impl Write>,
    ) {
        self.start(serial, clock, board, rpt, CmdId::Collect, "LOOP 1");
    }

    /// Starts setting the barometer and elevation calibration values.
    /// `barometer` is in thousandths of inHg, `elevation` in feet (see
    /// the conversion helpers at the bottom of this module).
    pub fn start_set_barometer(
        &mut self,
        serial: &mut impl SerialPort,
        clock: &impl MonotonicClock,
        board: &mut impl Board,
        rpt: &mut Reporter<impl Write>,
        barometer: i32,
        elevation: i32,
    ) {
        self.start(serial, clock, board, rpt, CmdId::SetBar, "BAR");
        self.parm1 = barometer;
        self.parm2 = elevation;
    }

    /// Starts a command whose text responses are echoed to the console.
    pub fn start_echo_resp(
        &mut self,
        serial: &mut impl SerialPort,
        clock: &impl MonotonicClock,
        board: &mut impl Board,
        rpt: &mut Reporter<impl Write>,
        cmd: &str,
    ) {
        self.start(serial, clock, board, rpt, CmdId::EchoResp, cmd);
    }

    /// Starts a check of the weather station clock.
    pub fn start_check_time(
        &mut self,
        serial: &mut impl SerialPort,
        clock: &impl MonotonicClock,
        board: &mut impl Board,
        rpt: &mut Reporter<impl Write>,
    ) {
        self.start(serial, clock, board, rpt, CmdId::ChkTime, "GETTIME");
    }

    /// Starts setting the weather station clock from the device clock.
    pub fn start_set_time(
        &mut self,
        serial: &mut impl SerialPort,
        clock: &impl MonotonicClock,
        board: &mut impl Board,
        rpt: &mut Reporter<impl Write>,
    ) {
        self.start(serial, clock, board, rpt, CmdId::SetTime, "SETTIME");
    }

    fn start(
        &mut self,
        serial: &mut impl SerialPort,
        clock: &impl MonotonicClock,
        board: &mut impl Board,
        rpt: &mut Reporter<impl Write>,
        id: CmdId,
        cmd: &str,
    ) {
        report!(rpt, DETAIL, "Starting");

        self.cleanup(serial);

        board.set_led(Led::Station, LedColour::Amber);

        self.state = State::Starting;
        self.condition = CollectStatus::Pending;

        self.cmd_id = id;
        self.cmd.clear();
        self.cmd.push_str(cmd);

        self.parm1 = 0;
        self.parm2 = 0;

        self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
    }

    /// Aborts the current command immediately and cleans up the serial
    /// port state.
    pub fn abort(
        &mut self,
        serial: &mut impl SerialPort,
        board: &mut impl Board,
        rpt: &mut Reporter<impl Write>,
    ) {
        report!(rpt, DETAIL, "Aborting");

        self.cleanup(serial);

        board.set_led(Led::Station, LedColour::Red);

        self.state = State::Idle;
        self.condition = CollectStatus::Failed(CollectError::Aborted);

        self.error_str = "Aborted";
    }

    /// Current status of the state machine.
    pub fn status(&self) -> CollectStatus {
        self.condition
    }

    /// The last LOOP packet received.
    pub fn data(&self) -> &[u8; DAV_DATA_LEN] {
        &self.data
    }

    /// Whether `data` holds a fully validated packet.
    pub fn data_valid(&self) -> bool {
        self.data_valid
    }

    /// Description of the most recent failure (or success).
    pub fn last_error(&self) -> &'static str {
        self.error_str
    }

    fn cleanup(&mut self, serial: &mut impl SerialPort) {
        let _ = serial.take_error(); // Ignore any serial error

        serial.flush_output(); // Flush buffers
        serial.flush_input();
    }

    /// Sends a wakeup character if attempts remain. Returns false once
    /// the attempt limit is exhausted.
    fn send_wakeup(
        &mut self,
        serial: &mut impl SerialPort,
        clock: &impl MonotonicClock,
        rpt: &mut Reporter<impl Write>,
    ) -> bool {
        if self.attempt_count == 0 {
            return false; // Maximum tries exceeded
        }

        self.attempt_count -= 1;
        self.resp_tout = MsDeadline::after(clock, MAX_WAKEUP_MS);

        report!(rpt, DETAIL, "Sending wakeup char");

        serial.flush_output();
        serial.flush_input();

        serial.write(b"\n");

        true
    }

    fn send_command(
        &mut self,
        serial: &mut impl SerialPort,
        clock: &impl MonotonicClock,
        rpt: &mut Reporter<impl Write>,
    ) {
        self.resp_tout = MsDeadline::after(clock, MAX_RESP_MS);

        serial.flush_output();
        serial.flush_input();

        match self.cmd_id {
            CmdId::SetBar => {
                report!(
                    rpt,
                    DETAIL,
                    "Sending '{}={} {}' command",
                    self.cmd,
                    self.parm1,
                    self.parm2
                );
                serial.write(format!("{}={} {}", self.cmd, self.parm1, self.parm2).as_bytes());
            }
            _ => {
                report!(rpt, DETAIL, "Sending '{}' command", self.cmd);
                serial.write(self.cmd.as_bytes());
            }
        }

        serial.write(b"\n");
    }

    /// Determines which state to enter after a command is sent.
    fn set_post_cmd_state(&mut self) {
        self.state = match self.cmd_id {
            CmdId::SetBar | CmdId::EchoResp => State::AwaitingOk,
            _ => State::AwaitingAck,
        };
    }

    /// Determines which state to enter after an ACK is received.
    fn set_post_ack_state(
        &mut self,
        serial: &mut impl SerialPort,
        clock: &impl MonotonicClock,
        rtc: &Rtc<impl WallClock>,
        rpt: &mut Reporter<impl Write>,
    ) -> Dispatch {
        match self.cmd_id {
            CmdId::Collect => {
                self.resp_tout = MsDeadline::after(clock, MAX_DATA_MS);
                self.state = State::AwaitingData;
            }

            CmdId::ChkTime => {
                self.resp_tout = MsDeadline::after(clock, MAX_TIME_MS);
                self.state = State::AwaitingTime;
            }

            CmdId::SetTime => {
                self.send_time(serial, rtc, rpt);
                self.cmd_id = CmdId::ExpectAck;
                self.resp_tout = MsDeadline::after(clock, MAX_TIME_MS);
                self.state = State::AwaitingAck;
            }

            _ => return Dispatch::Done, // Commands that just return ACK
        }

        Dispatch::Continue
    }

    /// Determines which state to enter after an OK is received.
    fn set_post_ok_state(
        &mut self,
        clock: &impl MonotonicClock,
        rpt: &mut Reporter<impl Write>,
    ) -> Dispatch {
        match self.cmd_id {
            CmdId::EchoResp => {
                report!(rpt, RAW_INFO, "\r\n[Start of output]\r\n");
                self.resp_tout = MsDeadline::after(clock, MAX_ECHO_MS);
                self.state = State::EchoingResp;
                Dispatch::Continue
            }

            _ => Dispatch::Done, // Commands that just return OK
        }
    }

    fn check_data_crc(&self, rpt: &mut Reporter<impl Write>) -> bool {
        let crc_calc = crc_calculate(&self.data[..DAV_DATA_LEN - 2]);
        let crc_recv =
            ((self.data[DAV_DATA_CRC_H] as u16) << 8) | self.data[DAV_DATA_CRC_L] as u16;

        report!(
            rpt,
            DETAIL,
            "Calculated CRC is {:04X}, Received CRC is {:04X}",
            crc_calc,
            crc_recv
        );

        crc_calc == crc_recv
    }

    fn check_time_crc(&self, rpt: &mut Reporter<impl Write>) -> bool {
        let crc_calc = crc_calculate(&self.time_buf[..DAV_TIME_LEN - 2]);
        let crc_recv =
            ((self.time_buf[DAV_TIME_CRC_H] as u16) << 8) | self.time_buf[DAV_TIME_CRC_L] as u16;

        report!(
            rpt,
            DETAIL,
            "Calculated CRC is {:04X}, Received CRC is {:04X}",
            crc_calc,
            crc_recv
        );

        crc_calc == crc_recv
    }

    fn dump_time(&self, rpt: &mut Reporter<impl Write>) {
        report!(rpt, DETAIL, "Time buffer:");

        for byte in &self.time_buf {
            report!(rpt, RAW_DETAIL, " {:02X}", byte);
        }

        report!(rpt, RAW_DETAIL, "\r\n");
    }

    /// Builds the 8-byte time packet from the device clock and sends it.
    fn send_time(
        &mut self,
        serial: &mut impl SerialPort,
        rtc: &Rtc<impl WallClock>,
        rpt: &mut Reporter<impl Write>,
    ) {
        let now_val = rtc.now();

        report!(rpt, DETAIL, "now_val = {}", now_val);

        if let Some(now) = DateTime::from_timestamp(now_val as i64, 0) {
            self.time_buf[DAV_TIME_SEC] = now.second() as u8;
            self.time_buf[DAV_TIME_MIN] = now.minute() as u8;
            self.time_buf[DAV_TIME_HOUR] = now.hour() as u8;
            self.time_buf[DAV_TIME_DAY] = now.day() as u8;
            self.time_buf[DAV_TIME_MONTH] = now.month() as u8;
            self.time_buf[DAV_TIME_YEAR] = (now.year() - 1900) as u8;
        }

        let crc_calc = crc_calculate(&self.time_buf[..DAV_TIME_LEN - 2]);
        self.time_buf[DAV_TIME_CRC_H] = (crc_calc >> 8) as u8;
        self.time_buf[DAV_TIME_CRC_L] = (crc_calc & 0xFF) as u8;

        self.dump_time(rpt);

        serial.write(&self.time_buf);
    }

    /// Decodes the received time packet and compares it to the device
    /// clock. True when the difference is within the allowed range.
    fn check_time_diff(
        &self,
        rtc: &Rtc<impl WallClock>,
        rpt: &mut Reporter<impl Write>,
    ) -> bool {
        let year = 1900 + self.time_buf[DAV_TIME_YEAR] as i32;
        let month = self.time_buf[DAV_TIME_MONTH] as u32;
        let day = self.time_buf[DAV_TIME_DAY] as u32;

        let cmp_val = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| {
                date.and_hms_opt(
                    self.time_buf[DAV_TIME_HOUR] as u32,
                    self.time_buf[DAV_TIME_MIN] as u32,
                    self.time_buf[DAV_TIME_SEC] as u32,
                )
            })
            .map(|dt| dt.and_utc().timestamp() as u32);

        let cmp_val = match cmp_val {
            Some(v) => v,
            // A packet that passes CRC but does not decode as a calendar
            // date still means the station clock needs setting.
            None => return false,
        };

        report!(rpt, DETAIL, "cmp_val = {}", cmp_val);

        rtc.diff(cmp_val) < MAX_DIFF_SECS
    }

    /// Echoes responses until no characters are seen for the echo
    /// timeout. Returns 1 when characters were echoed, 0 when idle and
    /// -1 once the quiet timeout has elapsed.
    fn echo_resp(
        &mut self,
        serial: &mut impl SerialPort,
        clock: &impl MonotonicClock,
        rpt: &mut Reporter<impl Write>,
    ) -> i8 {
        match serial.getc() {
            Some(ch) => {
                self.resp_tout = MsDeadline::after(clock, MAX_ECHO_MS);
                report!(rpt, RAW_INFO, "{}", ch as char);
                1
            }
            None if self.resp_tout.expired(clock) => {
                report!(rpt, RAW_INFO, "[End of output]\r\n");
                -1
            }
            None => 0,
        }
    }

    fn fail(
        &mut self,
        serial: &mut impl SerialPort,
        board: &mut impl Board,
        err: CollectError,
    ) -> CollectStatus {
        self.cleanup(serial);
        board.set_led(Led::Station, LedColour::Red);
        self.state = State::Idle;
        self.condition = CollectStatus::Failed(err);
        self.condition
    }

    fn succeed(&mut self, board: &mut impl Board) -> CollectStatus {
        self.error_str = "Success";
        board.set_led(Led::Station, LedColour::Green);
        self.state = State::Idle;
        self.condition = CollectStatus::Success;
        self.condition
    }

    /// Main tick routine which drives the state machine.
    pub fn tick(
        &mut self,
        serial: &mut impl SerialPort,
        clock: &impl MonotonicClock,
        rtc: &Rtc<impl WallClock>,
        board: &mut impl Board,
        rpt: &mut Reporter<impl Write>,
    ) -> CollectStatus {
        if self.state == State::Idle {
            self.cleanup(serial); // Clean out serial port
            return self.condition;
        }

        // Check whether a serial port error has occurred
        if serial.take_error() {
            self.error_str = "Serial port error";
            report!(rpt, PROBLEM, "{} in state {:?}", self.error_str, self.state);
            return self.fail(serial, board, CollectError::SerialErr);
        }

        // Check whether the overall timeout has occurred
        if self.timeout.expired(clock) {
            self.error_str = "Timed out";
            report!(rpt, PROBLEM, "{} in state {:?}", self.error_str, self.state);
            return self.fail(serial, board, CollectError::Timeout);
        }

        match self.state {
            // Attempt to wake up the weather station
            State::Starting => {
                self.attempt_count = MAX_WAKEUP_ATTEMPTS;
                let _ = self.send_wakeup(serial, clock, rpt);
                self.state = State::AwaitingLf;
                self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
            }

            // Wait for the first character of the wakeup response
            State::AwaitingLf => match serial.getc() {
                Some(b'\n') => {
                    // No report message or overall timeout reset here
                    self.state = State::AwaitingCr;
                }
                _ => {
                    if self.resp_tout.expired(clock)
                        && !self.send_wakeup(serial, clock, rpt)
                    {
                        self.error_str = "No wakeup response received";
                        report!(rpt, PROBLEM, "{}", self.error_str);
                        return self.fail(serial, board, CollectError::NoWakeup);
                    }
                }
            },

            // Wait for the second character of the wakeup response.
            // An unexpected byte retries the wakeup at once; a repeated
            // LF or silence retries only after the per-phase timeout.
            State::AwaitingCr => {
                let retry = match serial.getc() {
                    Some(b'\r') => {
                        report!(rpt, DETAIL, "Wakeup response received");
                        self.send_command(serial, clock, rpt);
                        self.set_post_cmd_state();
                        self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
                        false
                    }
                    Some(b'\n') | None => self.resp_tout.expired(clock),
                    Some(_) => true,
                };

                if retry {
                    if self.send_wakeup(serial, clock, rpt) {
                        self.state = State::AwaitingLf;
                    } else {
                        self.error_str = "Bad wakeup response received";
                        report!(rpt, PROBLEM, "{}", self.error_str);
                        return self.fail(serial, board, CollectError::BadWakeup);
                    }
                }
            }

            // Wait for the acknowledge response
            State::AwaitingAck => match serial.getc() {
                Some(DAV_ACK) => {
                    report!(rpt, DETAIL, "Acknowledgement received");
                    match self.set_post_ack_state(serial, clock, rtc, rpt) {
                        Dispatch::Done => return self.succeed(board),
                        Dispatch::Continue => {
                            self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
                        }
                    }
                }

                None => {
                    if self.resp_tout.expired(clock) {
                        self.error_str = "No acknowledgement received";
                        report!(rpt, PROBLEM, "{}", self.error_str);
                        return self.fail(serial, board, CollectError::NoAck);
                    }
                }

                Some(DAV_NAK) => {
                    self.error_str = "Negative acknowledgement received";
                    report!(rpt, PROBLEM, "{}", self.error_str);
                    return self.fail(serial, board, CollectError::NegAck);
                }

                Some(_) => {
                    self.error_str = "Bad acknowledgement received";
                    report!(rpt, PROBLEM, "{}", self.error_str);
                    return self.fail(serial, board, CollectError::BadAck);
                }
            },

            // Wait for a data packet of the required length
            State::AwaitingData => {
                if serial.recv_count() >= DAV_DATA_LEN {
                    self.data_valid = false;
                    serial.read(&mut self.data);

                    report!(rpt, DETAIL, "Data received");
                    self.state = State::CheckingData;
                    self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
                } else if self.resp_tout.expired(clock) {
                    self.error_str = "No data received";
                    report!(rpt, PROBLEM, "{}", self.error_str);
                    return self.fail(serial, board, CollectError::NoData);
                }
            }

            // Process the received data
            State::CheckingData => {
                if &self.data[..3] != b"LOO" {
                    self.error_str = "Data does not start with 'LOO'";
                    report!(rpt, PROBLEM, "{}", self.error_str);
                    return self.fail(serial, board, CollectError::BadData);
                }

                if self.data[DAV_DATA_LF] != b'\n' || self.data[DAV_DATA_CR] != b'\r' {
                    self.error_str = "Data does not contain LF, CR";
                    report!(rpt, PROBLEM, "{}", self.error_str);
                    return self.fail(serial, board, CollectError::BadData);
                }

                if !self.check_data_crc(rpt) {
                    self.error_str = "Data failed CRC check";
                    report!(rpt, PROBLEM, "{}", self.error_str);
                    return self.fail(serial, board, CollectError::BadCrc);
                }

                report!(rpt, DETAIL, "Data is valid");
                self.data_valid = true;
                return self.succeed(board);
            }

            // Wait for the OK response
            State::AwaitingOk => {
                if serial.recv_count() >= DAV_OK_RESP.len() {
                    let mut buf = [0u8; DAV_OK_RESP.len()];
                    serial.read(&mut buf);

                    if &buf[..] == DAV_OK_RESP {
                        report!(rpt, DETAIL, "OK response received");
                        match self.set_post_ok_state(clock, rpt) {
                            Dispatch::Done => return self.succeed(board),
                            Dispatch::Continue => {
                                self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
                            }
                        }
                    } else {
                        self.error_str = "Bad acknowledgement received";
                        report!(rpt, PROBLEM, "{}", self.error_str);
                        return self.fail(serial, board, CollectError::BadAck);
                    }
                } else if self.resp_tout.expired(clock) {
                    self.error_str = "No acknowledgement received";
                    report!(rpt, PROBLEM, "{}", self.error_str);
                    return self.fail(serial, board, CollectError::NoAck);
                }
            }

            // Echo text responses until the station goes quiet
            State::EchoingResp => {
                if self.echo_resp(serial, clock, rpt) < 0 {
                    return self.succeed(board);
                }
            }

            // Wait for a time packet of the required length
            State::AwaitingTime => {
                if serial.recv_count() >= DAV_TIME_LEN {
                    serial.read(&mut self.time_buf);
                    report!(rpt, DETAIL, "Time received");
                    self.dump_time(rpt);

                    if !self.check_time_crc(rpt) {
                        self.error_str = "Time failed CRC check";
                        report!(rpt, PROBLEM, "{}", self.error_str);
                        return self.fail(serial, board, CollectError::BadTime);
                    }

                    if !self.check_time_diff(rtc, rpt) {
                        self.error_str = "Time does not match Interface clock";
                        report!(rpt, DETAIL, "{}", self.error_str);
                        // No cleanup needed here
                        board.set_led(Led::Station, LedColour::Green);
                        self.state = State::Idle;
                        self.condition = CollectStatus::WrongTime;
                        return self.condition;
                    }

                    report!(rpt, DETAIL, "Time is correct");
                    return self.succeed(board);
                } else if self.resp_tout.expired(clock) {
                    self.error_str = "No time received";
                    report!(rpt, PROBLEM, "{}", self.error_str);
                    return self.fail(serial, board, CollectError::NoTime);
                }
            }

            State::Idle => unreachable!("idle handled above"),
        }

        // Pending states fall out of the match here
        my_trace!("collector pending in state {:?}", self.state);
        self.condition = CollectStatus::Pending;
        self.condition
    }

    // --- Diagnostic output ---

    const DUMP_COLS: usize = 20;

    /// Dumps the LOOP buffer to the console, followed by a few decoded
    /// example readings.
    pub fn dump_data(&self, rpt: &mut Reporter<impl Write>) {
        report!(rpt, RAW_INFO, "\r\n  + :");

        for col in 0..Self::DUMP_COLS {
            report!(rpt, RAW_INFO, " {:2}", col);
        }

        report!(rpt, RAW_INFO, "\r\n----:");

        for _ in 0..Self::DUMP_COLS {
            report!(rpt, RAW_INFO, "---");
        }

        for (loc, byte) in self.data.iter().enumerate() {
            if loc % Self::DUMP_COLS == 0 {
                report!(rpt, RAW_INFO, "\r\n{:3} :", loc);
            }
            report!(rpt, RAW_INFO, " {:02X}", byte);
        }

        report!(rpt, RAW_INFO, "\r\n\r\n");

        self.show_example_data(rpt);
    }

    fn show_example_data(&self, rpt: &mut Reporter<impl Write>) {
        let word = |hi: usize, lo: usize| ((self.data[hi] as u16) << 8) | self.data[lo] as u16;

        report!(
            rpt,
            RAW_INFO,
            "Barometer: {} inHg x 1000, ",
            word(DAV_DATA_BAR_H, DAV_DATA_BAR_L)
        );
        report!(
            rpt,
            RAW_INFO,
            "In Temp: {} F x 10, ",
            word(DAV_DATA_IN_TEMP_H, DAV_DATA_IN_TEMP_L)
        );
        report!(
            rpt,
            RAW_INFO,
            "Out Temp: {} F x 10\r\n",
            word(DAV_DATA_OUT_TEMP_H, DAV_DATA_OUT_TEMP_L)
        );

        report!(
            rpt,
            RAW_INFO,
            "Wind Speed: {} mph, ",
            self.data[DAV_DATA_WIND_SPEED]
        );
        report!(
            rpt,
            RAW_INFO,
            "Wind Direction: {} degrees\r\n\r\n",
            word(DAV_DATA_WIND_DIR_H, DAV_DATA_WIND_DIR_L)
        );
    }
}

// --- Unit conversion helpers (used by the configuration menu) ---

/// Converts integral millibars to integral thousandths of inHg using
/// fixed-point arithmetic. The accumulator limits the input to 2,219 mb;
/// the operational calibration range is far narrower (678..=1,100 mb),
/// which the menu enforces separately.
pub fn millibars_to_thousandths(millibars: u32) -> Option<u32> {
    if millibars > 2219 {
        return None;
    }
    Some((millibars * 1_935_276 + 32_768) >> 16)
}

/// Converts integral metres to integral feet using fixed-point
/// arithmetic. Valid for magnitudes up to 9,987 m (the result must fit
/// a 16-bit elevation field).
pub fn metres_to_feet(metres: i32) -> Option<i32> {
    let magnitude = metres.unsigned_abs();
    if magnitude > 9987 {
        return None;
    }

    let feet = ((magnitude * 53_753 + 8_192) >> 14) as i32;
    Some(if metres >= 0 { feet } else { -feet })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::DipSwitch;
    use alloc::collections::VecDeque;
    use alloc::vec::Vec;
    use core::cell::Cell;

    struct TestClock {
        ms: Cell<u32>,
    }

    impl TestClock {
        fn new() -> Self {
            TestClock { ms: Cell::new(0) }
        }
        fn advance(&self, ms: u32) {
            self.ms.set(self.ms.get() + ms);
        }
    }

    impl MonotonicClock for TestClock {
        fn millis(&self) -> u32 {
            self.ms.get()
        }
        fn seconds(&self) -> u32 {
            self.ms.get() / 1000
        }
    }

    struct TestWallClock(u32);

    impl WallClock for TestWallClock {
        fn now(&self) -> u32 {
            self.0
        }
        fn set(&mut self, secs: u32) {
            self.0 = secs;
        }
    }

    #[derive(Default)]
    struct FakeSerial {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
        error: bool,
    }

    impl FakeSerial {
        fn push(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes);
        }
    }

    impl SerialPort for FakeSerial {
        fn getc(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }
        fn recv_count(&mut self) -> usize {
            self.rx.len()
        }
        fn read(&mut self, buf: &mut [u8]) -> usize {
            let mut count = 0;
            for slot in buf.iter_mut() {
                match self.rx.pop_front() {
                    Some(b) => {
                        *slot = b;
                        count += 1;
                    }
                    None => break,
                }
            }
            count
        }
        fn write(&mut self, bytes: &[u8]) {
            self.tx.extend_from_slice(bytes);
        }
        fn flush_input(&mut self) {
            self.rx.clear();
        }
        fn flush_output(&mut self) {}
        fn take_error(&mut self) -> bool {
            core::mem::take(&mut self.error)
        }
    }

    #[derive(Default)]
    struct FakeBoard {
        station_led: Option<LedColour>,
    }

    impl Board for FakeBoard {
        fn set_led(&mut self, led: Led, colour: LedColour) {
            if led == Led::Station {
                self.station_led = Some(colour);
            }
        }
        fn refresh_switches(&mut self) {}
        fn dip(&self, _switch: DipSwitch) -> bool {
            false
        }
        fn rotary(&self) -> u8 {
            0
        }
        fn set_dtr(&mut self, _asserted: bool) {}
        fn set_rts(&mut self, _asserted: bool) {}
    }

    struct Harness {
        clock: TestClock,
        rtc: Rtc<TestWallClock>,
        serial: FakeSerial,
        board: FakeBoard,
        rpt: Reporter<String>,
        collector: Collector,
    }

    impl Harness {
        fn new() -> Self {
            let mut serial = FakeSerial::default();
            let mut board = FakeBoard::default();
            let collector = Collector::init(&mut serial, &mut board);
            Harness {
                clock: TestClock::new(),
                rtc: Rtc::new(TestWallClock(1_700_000_000)),
                serial,
                board,
                rpt: Reporter::new(String::new()),
                collector,
            }
        }

        fn tick(&mut self) -> CollectStatus {
            self.collector.tick(
                &mut self.serial,
                &self.clock,
                &self.rtc,
                &mut self.board,
                &mut self.rpt,
            )
        }

        fn wake_station(&mut self) {
            // Starting tick emits the wakeup; answer it.
            assert!(self.tick().is_pending());
            self.serial.push(b"\n\r");
            assert!(self.tick().is_pending()); // consumes LF
            assert!(self.tick().is_pending()); // consumes CR, sends command
        }
    }

    fn loop_packet() -> [u8; DAV_DATA_LEN] {
        let mut packet = [0u8; DAV_DATA_LEN];
        packet[..3].copy_from_slice(b"LOO");
        packet[DAV_DATA_LF] = b'\n';
        packet[DAV_DATA_CR] = b'\r';
        let crc = crc_calculate(&packet[..DAV_DATA_LEN - 2]);
        packet[DAV_DATA_CRC_H] = (crc >> 8) as u8;
        packet[DAV_DATA_CRC_L] = (crc & 0xFF) as u8;
        packet
    }

    fn time_packet(now: u32) -> [u8; DAV_TIME_LEN] {
        let dt = DateTime::from_timestamp(now as i64, 0).unwrap();
        let mut packet = [
            dt.second() as u8,
            dt.minute() as u8,
            dt.hour() as u8,
            dt.day() as u8,
            dt.month() as u8,
            (dt.year() - 1900) as u8,
            0,
            0,
        ];
        let crc = crc_calculate(&packet[..DAV_TIME_LEN - 2]);
        packet[DAV_TIME_CRC_H] = (crc >> 8) as u8;
        packet[DAV_TIME_CRC_L] = (crc & 0xFF) as u8;
        packet
    }

    #[test]
    fn collect_happy_path() {
        let mut h = Harness::new();
        h.collector
            .start_collect(&mut h.serial, &h.clock, &mut h.board, &mut h.rpt);

        h.wake_station();
        assert!(h.serial.tx.ends_with(b"LOOP 1\n"));

        h.serial.push(&[DAV_ACK]);
        assert!(h.tick().is_pending());

        h.serial.push(&loop_packet());
        assert!(h.tick().is_pending()); // reads the packet
        assert_eq!(h.tick(), CollectStatus::Success); // validates it

        assert!(h.collector.data_valid());
        assert_eq!(h.board.station_led, Some(LedColour::Green));
    }

    #[test]
    fn wakeup_retries_then_succeeds() {
        let mut h = Harness::new();
        h.collector
            .start_collect(&mut h.serial, &h.clock, &mut h.board, &mut h.rpt);

        assert!(h.tick().is_pending()); // first wakeup sent

        // Three more wakeups go unanswered.
        for _ in 0..3 {
            h.clock.advance(MAX_WAKEUP_MS as u32 + 1);
            assert!(h.tick().is_pending());
        }

        let wakeups = h.serial.tx.iter().filter(|&&b| b == b'\n').count();
        assert_eq!(wakeups, 4);

        // The fourth wakeup gets a response.
        h.serial.push(b"\n\r");
        assert!(h.tick().is_pending());
        assert!(h.tick().is_pending());
        assert!(h.serial.tx.ends_with(b"LOOP 1\n"));
    }

    #[test]
    fn wakeup_attempts_exhaust_to_no_wakeup() {
        let mut h = Harness::new();
        h.collector
            .start_collect(&mut h.serial, &h.clock, &mut h.board, &mut h.rpt);

        assert!(h.tick().is_pending());

        let mut status = CollectStatus::Pending;
        for _ in 0..MAX_WAKEUP_ATTEMPTS {
            h.clock.advance(MAX_WAKEUP_MS as u32 + 1);
            status = h.tick();
            if !status.is_pending() {
                break;
            }
        }

        assert_eq!(status, CollectStatus::Failed(CollectError::NoWakeup));
        assert_eq!(h.board.station_led, Some(LedColour::Red));
    }

    #[test]
    fn unexpected_byte_in_wakeup_retries_immediately() {
        let mut h = Harness::new();
        h.collector
            .start_collect(&mut h.serial, &h.clock, &mut h.board, &mut h.rpt);

        assert!(h.tick().is_pending());
        h.serial.push(b"\nX"); // LF then garbage instead of CR
        assert!(h.tick().is_pending());
        assert!(h.tick().is_pending()); // retried without waiting for the timeout

        let wakeups = h.serial.tx.iter().filter(|&&b| b == b'\n').count();
        assert_eq!(wakeups, 2);
    }

    #[test]
    fn crc_mismatch_fails_without_validating_data() {
        let mut h = Harness::new();
        h.collector
            .start_collect(&mut h.serial, &h.clock, &mut h.board, &mut h.rpt);
        h.wake_station();

        h.serial.push(&[DAV_ACK]);
        assert!(h.tick().is_pending());

        let mut packet = loop_packet();
        packet[50] ^= 0x01; // corrupt one payload byte
        h.serial.push(&packet);
        assert!(h.tick().is_pending());
        assert_eq!(h.tick(), CollectStatus::Failed(CollectError::BadCrc));
        assert!(!h.collector.data_valid());
    }

    #[test]
    fn nak_is_a_hard_error() {
        let mut h = Harness::new();
        h.collector
            .start_collect(&mut h.serial, &h.clock, &mut h.board, &mut h.rpt);
        h.wake_station();

        h.serial.push(&[DAV_NAK]);
        assert_eq!(h.tick(), CollectStatus::Failed(CollectError::NegAck));
    }

    #[test]
    fn check_time_within_window_succeeds() {
        let mut h = Harness::new();
        h.collector
            .start_check_time(&mut h.serial, &h.clock, &mut h.board, &mut h.rpt);
        h.wake_station();
        assert!(h.serial.tx.ends_with(b"GETTIME\n"));

        h.serial.push(&[DAV_ACK]);
        assert!(h.tick().is_pending());

        // Station clock 10 s off: inside the 30 s window.
        h.serial.push(&time_packet(1_700_000_010));
        assert_eq!(h.tick(), CollectStatus::Success);
    }

    #[test]
    fn check_time_out_of_window_reports_wrong_time() {
        let mut h = Harness::new();
        h.collector
            .start_check_time(&mut h.serial, &h.clock, &mut h.board, &mut h.rpt);
        h.wake_station();

        h.serial.push(&[DAV_ACK]);
        assert!(h.tick().is_pending());

        h.serial.push(&time_packet(1_700_000_600));
        assert_eq!(h.tick(), CollectStatus::WrongTime);
        // A wrong time is not an error: the LED still goes green.
        assert_eq!(h.board.station_led, Some(LedColour::Green));
    }

    #[test]
    fn set_time_sends_crc_framed_packet_and_awaits_second_ack() {
        let mut h = Harness::new();
        h.collector
            .start_set_time(&mut h.serial, &h.clock, &mut h.board, &mut h.rpt);
        h.wake_station();
        assert!(h.serial.tx.ends_with(b"SETTIME\n"));

        h.serial.push(&[DAV_ACK]);
        assert!(h.tick().is_pending()); // time packet goes out

        let sent = &h.serial.tx[h.serial.tx.len() - DAV_TIME_LEN..];
        let crc = crc_calculate(&sent[..DAV_TIME_LEN - 2]);
        assert_eq!(sent[DAV_TIME_CRC_H], (crc >> 8) as u8);
        assert_eq!(sent[DAV_TIME_CRC_L], (crc & 0xFF) as u8);
        assert_eq!(sent[DAV_TIME_YEAR], 123); // 2023

        h.serial.push(&[DAV_ACK]);
        assert_eq!(h.tick(), CollectStatus::Success);
    }

    #[test]
    fn set_then_check_time_round_trips() {
        // Emulates a station that adopts the time we send it.
        let mut h = Harness::new();
        h.collector
            .start_set_time(&mut h.serial, &h.clock, &mut h.board, &mut h.rpt);
        h.wake_station();
        h.serial.push(&[DAV_ACK]);
        assert!(h.tick().is_pending());
        let station_time: [u8; DAV_TIME_LEN] = h.serial.tx[h.serial.tx.len() - DAV_TIME_LEN..]
            .try_into()
            .unwrap();
        h.serial.push(&[DAV_ACK]);
        assert_eq!(h.tick(), CollectStatus::Success);

        h.collector
            .start_check_time(&mut h.serial, &h.clock, &mut h.board, &mut h.rpt);
        h.wake_station();
        h.serial.push(&[DAV_ACK]);
        assert!(h.tick().is_pending());
        h.serial.push(&station_time);
        assert_eq!(h.tick(), CollectStatus::Success);
    }

    #[test]
    fn set_barometer_expects_ok_string() {
        let mut h = Harness::new();
        h.collector.start_set_barometer(
            &mut h.serial,
            &h.clock,
            &mut h.board,
            &mut h.rpt,
            29_530,
            132,
        );
        h.wake_station();
        assert!(h.serial.tx.ends_with(b"BAR=29530 132\n"));

        h.serial.push(DAV_OK_RESP);
        assert_eq!(h.tick(), CollectStatus::Success);
    }

    #[test]
    fn overall_timeout_fires() {
        let mut h = Harness::new();
        h.collector
            .start_collect(&mut h.serial, &h.clock, &mut h.board, &mut h.rpt);
        h.wake_station();

        h.clock.advance(TIMEOUT_SECS * 1000 + 1000);
        assert_eq!(h.tick(), CollectStatus::Failed(CollectError::Timeout));
    }

    #[test]
    fn abort_reports_aborted() {
        let mut h = Harness::new();
        h.collector
            .start_collect(&mut h.serial, &h.clock, &mut h.board, &mut h.rpt);
        h.collector.abort(&mut h.serial, &mut h.board, &mut h.rpt);

        assert_eq!(
            h.collector.status(),
            CollectStatus::Failed(CollectError::Aborted)
        );
        assert_eq!(h.collector.last_error(), "Aborted");
        assert_eq!(h.board.station_led, Some(LedColour::Red));
    }

    #[test]
    fn status_codes_keep_the_sign_convention() {
        assert_eq!(CollectStatus::Pending.code(), 0);
        assert_eq!(CollectStatus::Success.code(), 1);
        assert_eq!(CollectStatus::WrongTime.code(), 2);
        assert!(CollectStatus::Failed(CollectError::NoWakeup).code() < 0);
    }

    #[test]
    fn millibar_conversion_matches_reference_points() {
        // 1013 mb is standard pressure, 29.91 inHg.
        assert_eq!(millibars_to_thousandths(1013), Some(29_914));
        assert_eq!(millibars_to_thousandths(0), Some(0));
        assert_eq!(millibars_to_thousandths(2220), None);
    }

    #[test]
    fn metre_conversion_handles_sign() {
        assert_eq!(metres_to_feet(100), Some(328));
        assert_eq!(metres_to_feet(-100), Some(-328));
        assert_eq!(metres_to_feet(10_000), None);
    }
}
