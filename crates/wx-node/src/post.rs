//! HTTP POST client.
//!
//! A complete definition of the format for HTTP commands, responses and
//! behaviour can be found in RFC 2616.
//!
//! The client owns a single body buffer. Callers clear it, add url- or
//! hex-encoded name/value pairs, then drive a transaction with `start`
//! and `tick`. A transaction resolves the destination (with a one-hour
//! DNS cache), opens the one outbound TCP socket, writes the request and
//! parses the response, surfacing both the transport outcome and the
//! application-level keyword the server printed in its body. A
//! `Server time = <secs>` line in the response disciplines the device
//! clock.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Write};
use core::net::Ipv4Addr;

use crate::bb::Retained;
use crate::hal::{
    Board, Led, LedColour, MonotonicClock, NetInterface, ResolveHandle, ResolveStatus, RetainedRam,
    SocketHandle, WallClock,
};
use crate::log::{my_debug, my_trace};
use crate::report::{Flags, Reporter, Severity, Source};
use crate::rtc::Rtc;
use crate::timeout::SecsDeadline;
use crate::report;

// Short-cut names for types of report output
const PROBLEM: Flags = Flags::new(Source::Post, Severity::PROBLEM);
const DETAIL: Flags = Flags::new(Source::Post, Severity::DETAIL);

const RAW_DETAIL: Flags = DETAIL.raw();

// Maximum length of hostname and path
const MAX_HOST_LEN: usize = 64;
const MAX_PATH_LEN: usize = 64;

/// Size of the line buffer for requests and responses.
const CMD_BUF_SIZE: usize = 350;

/// Default size of the body buffer (if not specified on initialisation).
const DEF_BODY_BUF_SIZE: usize = 512;

/// Identified responses from the remote server (must appear at the start
/// of a line).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RespResult {
    None,
    Success,
    BadId,
    BadData,
    Rejected,
}

const RESP_KEYWORDS: [(&str, RespResult); 4] = [
    ("Success!", RespResult::Success),
    ("Bad ID!", RespResult::BadId),
    ("Bad data!", RespResult::BadData),
    ("Reject!", RespResult::Rejected),
];

/// Field label for the server clock value within a response line.
const RESP_LABEL_TIME: &str = "Server time =";

/// Maximum allowed difference before the real-time clock is updated.
const MAX_DIFF_SECS: u32 = 40;

/// Maximum time to use a cached IP address before another DNS lookup.
const DNS_CACHE_SECS: u32 = 3600;

/// Number of seconds before timing out a POST attempt.
const TIMEOUT_SECS: u32 = 20;

/// Internal states for the POST client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
enum State {
    #[default]
    Idle = 0,
    Starting = 1,
    Resolving = 2,
    Opening = 3,
    AwaitingEstab = 4,
    SendingCommand = 5,
    SendingBody = 6,
    ReadingStatus = 7,
    ReadingHeaders = 8,
    CheckingBody = 9,
    ReadingBody = 10,
}

/// Hard failure kinds from the POST client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostError {
    NotStarted,
    CannotStart,
    Timeout,
    Aborted,
    DnsErr,
    SocketErr,
    ConnectionLost,
    SendErr,
    RespErr,
    ServerErr,
    BadId,
    Rejected,
    BadState,
}

impl fmt::Display for PostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            Self::NotStarted => "not started",
            Self::CannotStart => "cannot start",
            Self::Timeout => "timed out",
            Self::Aborted => "aborted",
            Self::DnsErr => "name resolution failed",
            Self::SocketErr => "socket open failed",
            Self::ConnectionLost => "connection lost",
            Self::SendErr => "socket write failed",
            Self::RespErr => "malformed response",
            Self::ServerErr => "server returned error class",
            Self::BadId => "station ID rejected",
            Self::Rejected => "transaction rejected",
            Self::BadState => "bad state",
        };
        f.write_str(desc)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PostError {}

/// Overall status of the POST client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostStatus {
    Pending,
    Success,
    Failed(PostError),
}

impl PostStatus {
    pub fn is_pending(self) -> bool {
        self == PostStatus::Pending
    }

    /// Integer form: 0 pending, 1 success, negative error kind. Kept for
    /// interfaces that rely on the sign convention.
    pub fn code(self) -> i8 {
        match self {
            Self::Pending => 0,
            Self::Success => 1,
            Self::Failed(e) => match e {
                PostError::NotStarted => -1,
                PostError::CannotStart => -2,
                PostError::Timeout => -3,
                PostError::Aborted => -4,
                PostError::DnsErr => -5,
                PostError::SocketErr => -6,
                PostError::ConnectionLost => -7,
                PostError::SendErr => -8,
                PostError::RespErr => -9,
                PostError::ServerErr => -10,
                PostError::BadId => -11,
                PostError::Rejected => -12,
                PostError::BadState => -13,
            },
        }
    }
}

/// Rejection reasons from `set_server`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerConfigError {
    BadHost,
    BadPath,
    BadProxy,
}

/// Rejection reasons from the body builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyError {
    /// The pair would not fit; the buffer is unchanged.
    Overflow,
    EmptyName,
    EmptyValue,
}

enum SendProgress {
    Done,
    Pending,
    Failed,
}

/// The HTTP POST state machine.
pub struct PostClient {
    state: State,
    condition: PostStatus,
    resp_class: u8,
    resp_result: RespResult,

    dns: Option<ResolveHandle>,
    timeout: SecsDeadline,
    socket: Option<SocketHandle>,
    servers_set: bool,

    server_host: String,
    server_path: String,
    server_port: u16,

    request_host: String,
    request_ip: Ipv4Addr,
    request_port: u16,

    /// Absolute-URI request target in use (proxy mode).
    proxied: bool,

    cached_ip: Option<Ipv4Addr>,
    cache_timeout: SecsDeadline,

    msg_buf: String,
    msg_pos: usize,

    line_buf: [u8; CMD_BUF_SIZE],
    line_len: usize,

    body: Vec<u8>,
    body_cap: usize,
    body_overflow: bool,
}

impl PostClient {
    /// Builds the client with a body buffer of `body_max_size` bytes
    /// (0 selects the default).
    pub fn new(body_max_size: usize) -> Self {
        let body_cap = if body_max_size != 0 {
            body_max_size
        } else {
            DEF_BODY_BUF_SIZE
        };

        PostClient {
            state: State::Idle,
            condition: PostStatus::Failed(PostError::NotStarted),
            resp_class: 0,
            resp_result: RespResult::None,
            dns: None,
            timeout: SecsDeadline::default(),
            socket: None,
            servers_set: false,
            server_host: String::new(),
            server_path: String::new(),
            server_port: 0,
            request_host: String::new(),
            request_ip: Ipv4Addr::UNSPECIFIED,
            request_port: 0,
            proxied: false,
            cached_ip: None,
            cache_timeout: SecsDeadline::default(),
            msg_buf: String::new(),
            msg_pos: 0,
            line_buf: [0; CMD_BUF_SIZE],
            line_len: 0,
            body: Vec::with_capacity(body_cap),
            body_cap,
            body_overflow: false,
        }
    }

    /// Sets up the server details. A proxy, when given, receives the TCP
    /// connection and an absolute-URI request target. Invalidates any
    /// cached DNS result.
    pub fn set_server(
        &mut self,
        host: &str,
        port: u16,
        path: &str,
        proxy: Option<(&str, u16)>,
    ) -> Result<(), ServerConfigError> {
        self.servers_set = false; // Assume failure
        self.cached_ip = None; // Invalidate any cached IP address

        if host.is_empty() || host.len() > MAX_HOST_LEN {
            return Err(ServerConfigError::BadHost);
        }

        if path.is_empty() || path.len() > MAX_PATH_LEN {
            return Err(ServerConfigError::BadPath);
        }

        self.server_host = String::from(host);
        self.server_path = String::from(path);
        self.server_port = port;

        match proxy {
            Some((proxy_host, proxy_port)) => {
                if proxy_host.is_empty() || proxy_host.len() > MAX_HOST_LEN {
                    return Err(ServerConfigError::BadProxy);
                }

                self.request_host = String::from(proxy_host);
                self.proxied = true;

                self.request_port = if proxy_port != 0 { proxy_port } else { port };
            }
            None => {
                self.request_host = String::from(host);
                self.proxied = false;
                self.request_port = port;
            }
        }

        self.servers_set = true;
        Ok(())
    }

    // --- Body builder ---

    /// Clears the body buffer for the addition of new variables.
    pub fn clear_body(&mut self) {
        self.body.clear();
        self.body_overflow = false;
    }

    /// Whether a pair has been refused for lack of room since the last
    /// `clear_body`.
    pub fn overflowed(&self) -> bool {
        self.body_overflow
    }

    /// The assembled body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Adds a name/value pair with URL encoding of both parts.
    pub fn add_str(&mut self, name: &str, value: &str) -> Result<(), BodyError> {
        if value.is_empty() {
            return Err(BodyError::EmptyValue);
        }
        self.add_pair(name, value.as_bytes(), true)
    }

    /// Adds a name/value pair whose value is emitted as uppercase
    /// hexadecimal digit pairs (the value may contain zero bytes).
    pub fn add_hex(&mut self, name: &str, value: &[u8]) -> Result<(), BodyError> {
        self.add_pair(name, value, false)
    }

    fn add_pair(&mut self, name: &str, value: &[u8], url_encode: bool) -> Result<(), BodyError> {
        if name.is_empty() {
            return Err(BodyError::EmptyName);
        }

        let start_pos = self.body.len();

        let result = self.try_add_pair(name, value, url_encode);
        if result.is_err() {
            // Restore the buffer to its state on entry.
            self.body.truncate(start_pos);
            self.body_overflow = true;
        }
        result
    }

    fn try_add_pair(
        &mut self,
        name: &str,
        value: &[u8],
        url_encode: bool,
    ) -> Result<(), BodyError> {
        if !self.body.is_empty() {
            self.push_char(b'&', false)?;
        }

        for &ch in name.as_bytes() {
            self.push_char(ch, true)?;
        }
        self.push_char(b'=', false)?;

        if url_encode {
            for &ch in value {
                self.push_char(ch, true)?;
            }
        } else {
            self.push_hex(value)?;
        }

        Ok(())
    }

    /// Attempts to add one character, hex-escaping non-alphanumerics when
    /// `url_encode` is set. Fails without writing if there is no room.
    fn push_char(&mut self, ch: u8, url_encode: bool) -> Result<(), BodyError> {
        let mut encoded = [ch, 0, 0];
        let mut len = 1;

        if url_encode && !ch.is_ascii_alphanumeric() {
            if ch == b' ' {
                encoded[0] = b'+';
            } else {
                encoded = [b'%', nibble_to_hex(ch >> 4), nibble_to_hex(ch)];
                len = 3;
            }
        }

        if self.body.len() + len >= self.body_cap {
            return Err(BodyError::Overflow);
        }

        self.body.extend_from_slice(&encoded[..len]);
        Ok(())
    }

    /// Attempts to add a fixed-length hexadecimal string. Checked as a
    /// whole before anything is written.
    fn push_hex(&mut self, bytes: &[u8]) -> Result<(), BodyError> {
        if self.body.len() + bytes.len() * 2 >= self.body_cap {
            return Err(BodyError::Overflow); // Not enough room in body buffer
        }

        for &byte in bytes {
            self.body.push(nibble_to_hex(byte >> 4));
            self.body.push(nibble_to_hex(byte));
        }

        Ok(())
    }

    // --- Transaction control ---

    /// Starts the POST state machine. Both failure cases are permanent
    /// configuration errors.
    pub fn start(
        &mut self,
        net: &mut impl NetInterface,
        board: &mut impl Board,
        clock: &impl MonotonicClock,
        rpt: &mut Reporter<impl Write>,
    ) -> Result<(), PostError> {
        self.cleanup(net, rpt);

        if !self.servers_set {
            report!(rpt, PROBLEM, "Cannot start - servers not set");
            board.set_led(Led::Post, LedColour::Red);

            self.state = State::Idle;
            self.condition = PostStatus::Failed(PostError::CannotStart);
            return Err(PostError::CannotStart);
        }

        if self.body.is_empty() {
            report!(rpt, PROBLEM, "Cannot start - no body text");
            board.set_led(Led::Post, LedColour::Red);

            self.state = State::Idle;
            self.condition = PostStatus::Failed(PostError::CannotStart);
            return Err(PostError::CannotStart);
        }

        report!(rpt, DETAIL, "Starting");

        board.set_led(Led::Post, LedColour::Amber);

        self.state = State::Starting;
        self.condition = PostStatus::Pending;
        self.resp_class = 0;
        self.resp_result = RespResult::None;

        self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
        Ok(())
    }

    /// Aborts the POST state machine immediately, cancelling any pending
    /// resolve and closing the socket.
    pub fn abort(
        &mut self,
        net: &mut impl NetInterface,
        board: &mut impl Board,
        rpt: &mut Reporter<impl Write>,
        retained: &mut Retained<impl RetainedRam>,
    ) {
        report!(rpt, DETAIL, "Aborting");

        self.cleanup(net, rpt);

        board.set_led(Led::Post, LedColour::Red);

        retained.set_post_error_desc("Aborted");
        retained.set_post_error_state(-1);

        self.state = State::Idle;
        self.condition = PostStatus::Failed(PostError::Aborted);
    }

    /// Current status of the state machine.
    pub fn status(&self) -> PostStatus {
        self.condition
    }

    /// Class digit (1-5) from the server's status line in the last
    /// transaction; 0 if none was received. Interesting after a
    /// `ServerErr` outcome.
    pub fn resp_class(&self) -> u8 {
        self.resp_class
    }

    fn cleanup(&mut self, net: &mut impl NetInterface, rpt: &mut Reporter<impl Write>) {
        if let Some(dns) = self.dns.take() {
            report!(rpt, DETAIL, "Cancelling resolve request");
            net.resolve_cancel(dns);
        }

        if let Some(sock) = self.socket.take() {
            report!(rpt, DETAIL, "Closing socket");
            net.abort(sock);
        }
    }

    fn fail(
        &mut self,
        net: &mut impl NetInterface,
        board: &mut impl Board,
        rpt: &mut Reporter<impl Write>,
        retained: &mut Retained<impl RetainedRam>,
        err: PostError,
    ) -> PostStatus {
        self.cleanup(net, rpt);
        board.set_led(Led::Post, LedColour::Red);

        retained.set_post_error_state(self.state as i32);

        self.cached_ip = None; // Invalidate cached IP address

        self.state = State::Idle;
        self.condition = PostStatus::Failed(err);
        self.condition
    }

    /// Attempts to read one response line into the line buffer.
    fn get_response(
        &mut self,
        net: &mut impl NetInterface,
        rpt: &mut Reporter<impl Write>,
    ) -> bool {
        let Some(sock) = self.socket else {
            return false;
        };

        match net.read_line(sock, &mut self.line_buf) {
            Some(len) => {
                self.line_len = len;
                if len > 0 {
                    report!(
                        rpt,
                        DETAIL,
                        "Read: {}",
                        core::str::from_utf8(&self.line_buf[..len]).unwrap_or("(non-ASCII line)")
                    );
                } else {
                    report!(rpt, DETAIL, "Read: (blank line)");
                }
                true
            }
            None => false,
        }
    }

    fn line(&self) -> &[u8] {
        &self.line_buf[..self.line_len]
    }

    /// Attempts to push out the window of `msg` not yet written.
    fn send_message(
        &mut self,
        net: &mut impl NetInterface,
        rpt: &mut Reporter<impl Write>,
        retained: &mut Retained<impl RetainedRam>,
        from_body: bool,
    ) -> SendProgress {
        let Some(sock) = self.socket else {
            return SendProgress::Failed;
        };

        let msg: &[u8] = if from_body {
            &self.body
        } else {
            self.msg_buf.as_bytes()
        };
        let msg_len = msg.len();

        let rc = match net.write(sock, &msg[self.msg_pos..]) {
            Ok(n) => n,
            Err(_) => {
                retained.set_post_error_desc("Socket write failed");
                report!(rpt, PROBLEM, "Socket write failed");
                return SendProgress::Failed;
            }
        };

        if rc > 0 {
            report!(rpt, DETAIL, "Wrote {} bytes", rc);
        }

        self.msg_pos += rc;

        if self.msg_pos == msg_len {
            report!(rpt, DETAIL, "Write completed ({} bytes)", self.msg_pos);
            return SendProgress::Done;
        }

        SendProgress::Pending
    }

    /// Checks the response status line, capturing the class digit.
    fn check_resp_status(
        &mut self,
        rpt: &mut Reporter<impl Write>,
        retained: &mut Retained<impl RetainedRam>,
    ) -> Result<(), ()> {
        let line = self.line_buf[..self.line_len].to_vec();

        if line.len() < 5 || !line[..5].eq_ignore_ascii_case(b"HTTP/") {
            retained.set_post_error_desc("HTTP header not found in status response");
            report!(rpt, PROBLEM, "HTTP header not found in status response");
            return Err(());
        }

        let Some(space_at) = line.iter().position(|&b| b == b' ' || b == b'\t') else {
            retained.set_post_error_desc("Delimiting space not found in status response");
            report!(rpt, PROBLEM, "Delimiting space not found in status response");
            return Err(());
        };

        let rest = &line[space_at..];
        let Some(&class) = rest.iter().find(|&&b| b != b' ' && b != b'\t') else {
            retained.set_post_error_desc("Unable to skip past space in status response");
            report!(rpt, PROBLEM, "Unable to skip past space in status response");
            return Err(());
        };

        if !(b'1'..=b'5').contains(&class) {
            retained.set_post_error_desc("Unexpected class digit");
            report!(rpt, PROBLEM, "Unexpected class digit: {}", class as char);
            return Err(());
        }

        self.resp_class = class - b'0';
        Ok(())
    }

    /// Checks a response line for one of the known result keywords.
    fn check_resp_result(&mut self, rpt: &mut Reporter<impl Write>) -> bool {
        for (keyword, result) in RESP_KEYWORDS {
            let kw = keyword.as_bytes();
            if self.line_len >= kw.len() && self.line_buf[..kw.len()].eq_ignore_ascii_case(kw) {
                self.resp_result = result;
                report!(rpt, DETAIL, "Found response {:?}", result);
                return true;
            }
        }

        false
    }

    /// Checks a response line for a server clock value and disciplines
    /// the real-time clock from it.
    ///
    /// The clock is only marked validated when it already agrees with the
    /// server; when it has to be adjusted it stays unvalidated so the
    /// next transaction confirms the new setting.
    fn check_resp_time(
        &mut self,
        rtc: &mut Rtc<impl WallClock>,
        rpt: &mut Reporter<impl Write>,
    ) {
        let label = RESP_LABEL_TIME.as_bytes();
        if self.line_len < label.len() || !self.line_buf[..label.len()].eq_ignore_ascii_case(label)
        {
            return;
        }

        let rest = &self.line_buf[label.len()..self.line_len];
        let digits = rest.iter().skip_while(|&&b| b == b' ' || b == b'\t');

        let mut value: u64 = 0;
        let mut seen_digit = false;
        for &b in digits {
            if !b.is_ascii_digit() {
                break;
            }
            seen_digit = true;
            value = value.saturating_mul(10).saturating_add((b - b'0') as u64);
        }

        if !seen_digit || value == 0 {
            report!(rpt, PROBLEM, "Server time value is zero or non-numeric");
            return;
        }

        if value >= u32::MAX as u64 {
            report!(rpt, PROBLEM, "Server time value is too large");
            return;
        }

        let value = value as u32;

        if rtc.diff(value) < MAX_DIFF_SECS {
            report!(rpt, DETAIL, "Interface clock matches server time");
            rtc.set_validated(true);
            return;
        }

        rtc.set(value); // Update real-time clock

        report!(rpt, DETAIL, "Interface clock adjusted to {}", rtc.timestamp_str());
        rtc.set_validated(false);
    }

    /// Main tick routine which drives the POST state machine.
    pub fn tick(
        &mut self,
        net: &mut impl NetInterface,
        clock: &impl MonotonicClock,
        rtc: &mut Rtc<impl WallClock>,
        board: &mut impl Board,
        rpt: &mut Reporter<impl Write>,
        retained: &mut Retained<impl RetainedRam>,
    ) -> PostStatus {
        if self.state == State::Idle {
            return self.condition; // Nothing to do
        }

        // Check whether the socket has closed prematurely. The check is
        // suppressed in ReadingBody, where the server close is the
        // expected terminator.
        if self.state != State::ReadingBody {
            if let Some(sock) = self.socket {
                if !net.alive(sock) {
                    retained.set_post_error_desc("Socket closed unexpectedly");
                    report!(
                        rpt,
                        PROBLEM,
                        "Socket closed unexpectedly in state {:?}",
                        self.state
                    );
                    self.socket = None; // Already dead; nothing to close
                    return self.fail(net, board, rpt, retained, PostError::ConnectionLost);
                }
            }
        }

        // Check whether the overall timeout has occurred
        if self.timeout.expired(clock) {
            retained.set_post_error_desc("Timed out");
            report!(rpt, PROBLEM, "Timed out in state {:?}", self.state);
            return self.fail(net, board, rpt, retained, PostError::Timeout);
        }

        match self.state {
            // Choose the destination address
            State::Starting => {
                if let (Some(cached), false) =
                    (self.cached_ip, self.cache_timeout.expired(clock))
                {
                    my_debug!("using cached address {}", cached);
                    self.request_ip = cached;
                    self.state = State::Opening;
                    self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
                } else if let Some(direct) = parse_dotted_quad(&self.request_host) {
                    self.request_ip = direct;
                    self.state = State::Opening;
                    self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
                } else {
                    report!(rpt, DETAIL, "Resolving {}", self.request_host);
                    match net.resolve_start(&self.request_host) {
                        Ok(handle) => {
                            self.dns = Some(handle);
                            self.state = State::Resolving;
                            self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
                        }
                        Err(_) => {
                            retained.set_post_error_desc("Error starting resolve");
                            report!(rpt, PROBLEM, "Error starting resolve");
                            return self.fail(net, board, rpt, retained, PostError::DnsErr);
                        }
                    }
                }
            }

            // Wait for the server name to resolve
            State::Resolving => {
                net.tick(); // Needed to drive the resolver

                let Some(handle) = self.dns else {
                    report!(rpt, PROBLEM, "Bad state encountered");
                    return self.fail(net, board, rpt, retained, PostError::BadState);
                };
                match net.resolve_check(handle) {
                    ResolveStatus::Pending => {}

                    ResolveStatus::Resolved(ip) => {
                        self.dns = None;
                        self.request_ip = ip;
                        self.cached_ip = Some(ip); // Update cache
                        self.cache_timeout = SecsDeadline::after(clock, DNS_CACHE_SECS);
                        self.state = State::Opening;
                        self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
                    }

                    ResolveStatus::NoSuchHost => {
                        self.dns = None;
                        retained.set_post_error_desc("Resolve failed - host name does not exist");
                        report!(rpt, PROBLEM, "Resolve failed - host name does not exist");
                        return self.fail(net, board, rpt, retained, PostError::DnsErr);
                    }

                    ResolveStatus::Failed => {
                        self.dns = None;
                        retained.set_post_error_desc("Error during resolve");
                        report!(rpt, PROBLEM, "Error during resolve");
                        return self.fail(net, board, rpt, retained, PostError::DnsErr);
                    }
                }
            }

            // Open the TCP connection
            State::Opening => {
                report!(
                    rpt,
                    DETAIL,
                    "Opening to {}:{}",
                    self.request_ip,
                    self.request_port
                );

                match net.open(self.request_ip, self.request_port) {
                    Ok(sock) => {
                        self.socket = Some(sock);
                        self.state = State::AwaitingEstab;
                        self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
                    }
                    Err(_) => {
                        retained.set_post_error_desc("Error opening socket");
                        report!(rpt, PROBLEM, "Error opening socket");
                        return self.fail(net, board, rpt, retained, PostError::SocketErr);
                    }
                }
            }

            // Wait for the connection to be established
            State::AwaitingEstab => {
                let Some(sock) = self.socket else {
                    report!(rpt, PROBLEM, "Bad state encountered");
                    return self.fail(net, board, rpt, retained, PostError::BadState);
                };
                if net.established(sock) {
                    report!(rpt, DETAIL, "Connected");

                    let (abs_prefix, abs_host) = if self.proxied {
                        ("http://", self.server_host.as_str())
                    } else {
                        ("", "")
                    };

                    self.msg_buf = format!(
                        "POST {}{}{} HTTP/1.1\r\n\
                         Connection: close\r\n\
                         Host: {}:{}\r\n\
                         User-Agent: Rabbit\r\n\
                         Content-Type: application/x-www-form-urlencoded\r\n\
                         Content-Length: {}\r\n\
                         \r\n",
                        abs_prefix,
                        abs_host,
                        self.server_path,
                        self.server_host,
                        self.server_port,
                        self.body.len()
                    );

                    report!(rpt, DETAIL, "Sending command header:");
                    report!(rpt, RAW_DETAIL, "{}", self.msg_buf);

                    self.msg_pos = 0;
                    self.state = State::SendingCommand;
                    self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
                }
            }

            // Send the request header
            State::SendingCommand => match self.send_message(net, rpt, retained, false) {
                SendProgress::Done => {
                    report!(rpt, DETAIL, "Sending body text:");
                    if let Ok(text) = core::str::from_utf8(&self.body) {
                        report!(rpt, RAW_DETAIL, "{}\r\n", text);
                    }

                    self.msg_pos = 0;
                    self.state = State::SendingBody;
                    self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
                }
                SendProgress::Pending => {}
                SendProgress::Failed => {
                    return self.fail(net, board, rpt, retained, PostError::SendErr);
                }
            },

            // Send the body
            State::SendingBody => match self.send_message(net, rpt, retained, true) {
                SendProgress::Done => {
                    self.state = State::ReadingStatus;
                    self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
                }
                SendProgress::Pending => {}
                SendProgress::Failed => {
                    return self.fail(net, board, rpt, retained, PostError::SendErr);
                }
            },

            // Wait for the status line of the response
            State::ReadingStatus => {
                if self.get_response(net, rpt) {
                    if self.check_resp_status(rpt, retained).is_err() {
                        return self.fail(net, board, rpt, retained, PostError::RespErr);
                    }

                    if self.resp_class != 1 && self.resp_class != 2 {
                        retained.set_post_error_desc("Remote server returned error class");
                        report!(
                            rpt,
                            PROBLEM,
                            "Remote server returned error class {}",
                            self.resp_class
                        );
                        return self.fail(net, board, rpt, retained, PostError::ServerErr);
                    }

                    report!(rpt, DETAIL, "Remote server returned class {}", self.resp_class);
                    self.state = State::ReadingHeaders;
                    self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
                }
            }

            // Read header lines until the blank separator
            State::ReadingHeaders => {
                if self.get_response(net, rpt) && self.line().is_empty() {
                    report!(rpt, DETAIL, "End of headers found");

                    if self.resp_class == 1 {
                        // Was 1XX Continue: the real status follows.
                        self.state = State::ReadingStatus;
                    } else {
                        self.state = State::CheckingBody;
                    }
                    self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
                }
            }

            // Scan body lines for the server time and the result keyword
            State::CheckingBody => {
                if self.get_response(net, rpt) {
                    self.check_resp_time(rtc, rpt);

                    if self.check_resp_result(rpt) {
                        self.state = State::ReadingBody;
                        self.timeout = SecsDeadline::after(clock, TIMEOUT_SECS);
                    }
                }
            }

            // Drain the rest of the body until the server closes
            State::ReadingBody => {
                let Some(sock) = self.socket else {
                    report!(rpt, PROBLEM, "Bad state encountered");
                    return self.fail(net, board, rpt, retained, PostError::BadState);
                };
                if !net.alive(sock) {
                    report!(rpt, DETAIL, "Connection closed");

                    self.socket = None;

                    match self.resp_result {
                        RespResult::Success => {} // Nothing to do

                        RespResult::BadId => {
                            retained.set_post_error_desc("Station ID rejected by server");
                            report!(rpt, PROBLEM, "Station ID rejected by server");
                            return self.fail(net, board, rpt, retained, PostError::BadId);
                        }

                        RespResult::BadData => {
                            // The transport succeeded; the server merely
                            // rejected the observation.
                            report!(rpt, PROBLEM, "Server reported invalid data from sensor suite");
                            board.set_led(Led::Station, LedColour::Off);
                        }

                        RespResult::Rejected | RespResult::None => {
                            retained.set_post_error_desc("Transaction rejected by server");
                            report!(rpt, PROBLEM, "Transaction rejected by server");
                            return self.fail(net, board, rpt, retained, PostError::Rejected);
                        }
                    }

                    board.set_led(Led::Post, LedColour::Green);

                    retained.set_post_error_desc("Succeeded");
                    retained.set_post_error_state(self.state as i32);

                    self.state = State::Idle;
                    self.condition = PostStatus::Success;
                    return self.condition;
                }

                let _ = self.get_response(net, rpt); // Content is ignored
            }

            State::Idle => unreachable!("idle handled above"),
        }

        // Pending states fall out of the match here
        my_trace!("post client pending in state {:?}", self.state);
        self.condition = PostStatus::Pending;
        self.condition
    }
}

fn nibble_to_hex(nibble: u8) -> u8 {
    let nibble = nibble & 0x0F; // Discard upper bits

    if nibble <= 9 {
        nibble + b'0'
    } else {
        nibble + b'A' - 10
    }
}

/// Checks a host name for a numeric dotted-quad address. The unspecified
/// address does not count as a match, so it still goes to the resolver.
fn parse_dotted_quad(name: &str) -> Option<Ipv4Addr> {
    match name.parse::<Ipv4Addr>() {
        Ok(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}
