// crates/wx-node/src/hal.rs

//! Hardware Abstraction Layer (HAL) traits that keep the firmware core
//! platform-agnostic (no_std). Board I/O, the serial UART, the TCP/IP
//! stack, the I2C byte driver beneath the EEPROM and the third-party
//! firmware downloader all live behind these traits; the `wx-node-host`
//! crate and the test simulator provide implementations.

use core::fmt;
use core::net::Ipv4Addr;

// --- Clocks ---

/// Free-running monotonic counters used for all deadline arithmetic.
///
/// Both counters wrap; see `timeout` for the signed-subtraction expiry
/// checks that make the wrap harmless.
pub trait MonotonicClock {
    /// Millisecond counter.
    fn millis(&self) -> u32;
    /// Second counter.
    fn seconds(&self) -> u32;
}

/// The battery-backed real-time clock, read and written as seconds since
/// the Unix epoch.
pub trait WallClock {
    fn now(&self) -> u32;
    fn set(&mut self, secs: u32);
}

// --- Serial port (weather station link, 19,200 bps 8N1) ---

pub trait SerialPort {
    /// Reads one byte if available.
    fn getc(&mut self) -> Option<u8>;
    /// Number of bytes waiting in the receive buffer.
    fn recv_count(&mut self) -> usize;
    /// Reads up to `buf.len()` buffered bytes, returning the count read.
    fn read(&mut self, buf: &mut [u8]) -> usize;
    /// Queues bytes for transmission.
    fn write(&mut self, bytes: &[u8]);
    fn flush_input(&mut self);
    fn flush_output(&mut self);
    /// Reads and clears the latched receive-error condition (framing,
    /// overrun or parity).
    fn take_error(&mut self) -> bool;
}

// --- Board I/O (status LEDs, DIP and rotary switches, handshake pins) ---

/// The four bi-colour status LEDs, left to right on the front panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Led {
    Lan,
    Station,
    Post,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedColour {
    Off,
    Green,
    Red,
    Amber,
}

/// Configuration DIP switches, by function rather than position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DipSwitch {
    /// Switch 1: route the console to the UDP debug channel.
    UdpDebug,
    /// Switch 2: verbose report output (when the stored mode is unset).
    VerboseReports,
    /// Switch 3: slow collection cadence (when the stored period is unset).
    SlowCollect,
    /// Switch 4: install defaults over invalid parameter blocks at boot.
    WriteDefaults,
}

pub trait Board {
    fn set_led(&mut self, led: Led, colour: LedColour);

    fn set_all_leds(&mut self, colour: LedColour) {
        for led in [Led::Lan, Led::Station, Led::Post, Led::Download] {
            self.set_led(led, colour);
        }
    }

    /// Re-samples the switch inputs; `dip` and `rotary` return the values
    /// captured by the most recent refresh.
    fn refresh_switches(&mut self);
    fn dip(&self, switch: DipSwitch) -> bool;
    /// Rotary station-ID offset selector, 0..=15.
    fn rotary(&self) -> u8;

    /// Serial handshake outputs towards the weather station.
    fn set_dtr(&mut self, asserted: bool);
    fn set_rts(&mut self, asserted: bool);
}

// --- Operator console ---

/// Keystroke input from the active console (local serial or UDP debug).
pub trait ConsoleIn {
    fn getc(&mut self) -> Option<u8>;
}

// Console output is plain `core::fmt::Write`; see `report::Reporter`.

/// Forces a watchdog reset. Implementations do not return.
pub trait Watchdog {
    fn force_reset(&mut self) -> !;
}

// --- Non-volatile memory (EEPROM behind the I2C driver) ---

/// Transport-level failures from the I2C byte driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvError {
    /// Clock stretch timeout on the bus.
    ClockTimeout,
    /// Device did not acknowledge.
    Nak,
    /// Retries exhausted.
    TooManyRetries,
    /// Read-back comparison found a difference.
    CompareMismatch,
}

impl fmt::Display for NvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClockTimeout => write!(f, "I2C clock timeout"),
            Self::Nak => write!(f, "I2C NAK"),
            Self::TooManyRetries => write!(f, "I2C retries exhausted"),
            Self::CompareMismatch => write!(f, "read-back compare mismatch"),
        }
    }
}

impl NvError {
    /// True for bus-level faults, false for the semantic compare mismatch.
    pub fn is_transport(self) -> bool {
        !matches!(self, NvError::CompareMismatch)
    }
}

/// Byte-addressed access to the parameter EEPROM. Addresses are raw device
/// subaddresses; the parameter store imposes the page structure.
pub trait NvMemory {
    fn read(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), NvError>;
    /// Writes at most one EEPROM page worth of data.
    fn write(&mut self, addr: u16, data: &[u8]) -> Result<(), NvError>;
    /// Compares stored bytes against `data`, failing with
    /// [`NvError::CompareMismatch`] on any difference.
    fn compare(&mut self, addr: u16, data: &[u8]) -> Result<(), NvError>;
}

/// Battery-backed RAM image that survives a watchdog reset.
pub trait RetainedRam {
    /// Copies the retained image into `buf` (zero-filled if never written).
    fn load(&mut self, buf: &mut [u8]);
    /// Replaces the retained image.
    fn store(&mut self, data: &[u8]);
}

// --- Network interface (Ethernet + IP + DNS + one TCP socket) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Socket layer failed to initialise.
    StackInit,
    /// Interface (re)configuration was rejected.
    IfConfig,
    /// The resolver could not accept another request.
    Resolver,
    /// No socket available or connection could not be initiated.
    Socket,
    /// A socket write failed outright.
    Send,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackInit => write!(f, "socket layer initialisation failed"),
            Self::IfConfig => write!(f, "interface configuration rejected"),
            Self::Resolver => write!(f, "resolver unavailable"),
            Self::Socket => write!(f, "socket open failed"),
            Self::Send => write!(f, "socket write failed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for NetError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveHandle(pub u32);

/// Interface bring-up progress, polled while waiting for the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfState {
    Down,
    ComingUp,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    Pending,
    Resolved(Ipv4Addr),
    /// The name definitely does not exist.
    NoSuchHost,
    /// The resolver failed for another reason.
    Failed,
}

/// Interface configuration for a bring-up attempt.
#[derive(Debug, Clone, Copy)]
pub struct IfConfig<'a> {
    pub dhcp: bool,
    pub dhcp_timeout_secs: u16,
    /// Ask the stack to fall back to the static values below if DHCP fails.
    pub dhcp_fallback: bool,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Static-configuration name server (ignored under DHCP).
    pub dns: Option<Ipv4Addr>,
    /// Static-configuration router (ignored under DHCP).
    pub router: Option<Ipv4Addr>,
    /// Host name offered to the DHCP server.
    pub host_name: &'a str,
}

/// Addressing details of the running interface, for the operator display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkParams {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mac: [u8; 6],
    pub mtu: u16,
}

/// DHCP lease details, for the operator display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpInfo {
    pub server: Ipv4Addr,
    pub dns: [Ipv4Addr; 2],
    pub routers: [Ipv4Addr; 2],
    pub lease_secs: u32,
    pub t1_secs: u32,
    pub t2_secs: u32,
}

pub trait NetInterface {
    // Interface management
    fn stack_init(&mut self) -> Result<(), NetError>;
    /// Physical Ethernet link presence.
    fn have_link(&mut self) -> bool;
    /// Starts a bring-up attempt; completion is polled via `pending`.
    fn bring_up(&mut self, cfg: &IfConfig<'_>) -> Result<(), NetError>;
    fn bring_down(&mut self) -> Result<(), NetError>;
    fn pending(&mut self) -> IfState;
    /// IP interface currently up.
    fn if_up(&mut self) -> bool;
    /// DHCP lease currently valid (true when DHCP is not in use).
    fn dhcp_ok(&mut self) -> bool;
    /// Whether the last DHCP bring-up fell back to the static values.
    fn dhcp_fell_back(&mut self) -> Result<bool, NetError>;
    /// True if the running configuration was obtained via DHCP.
    fn dhcp_enabled(&mut self) -> bool;
    /// Replaces name server and router after a DHCP fallback.
    fn set_fallback_servers(&mut self, dns: Ipv4Addr, router: Ipv4Addr) -> Result<(), NetError>;
    fn local_ip(&mut self) -> Option<Ipv4Addr>;
    fn link_params(&mut self) -> Option<LinkParams>;
    fn dhcp_info(&mut self) -> Option<DhcpInfo>;
    /// Background stack processing; must be called regularly while active.
    fn tick(&mut self);

    // DNS
    fn resolve_start(&mut self, host: &str) -> Result<ResolveHandle, NetError>;
    fn resolve_check(&mut self, handle: ResolveHandle) -> ResolveStatus;
    fn resolve_cancel(&mut self, handle: ResolveHandle);

    // TCP (one outbound socket)
    fn open(&mut self, ip: Ipv4Addr, port: u16) -> Result<SocketHandle, NetError>;
    fn established(&mut self, sock: SocketHandle) -> bool;
    /// False once the peer has closed and all buffered data is consumed.
    fn alive(&mut self, sock: SocketHandle) -> bool;
    /// Reads one CR/LF-delimited line (terminator stripped) into `buf`,
    /// returning its length, or `None` if no complete line is buffered.
    fn read_line(&mut self, sock: SocketHandle, buf: &mut [u8]) -> Option<usize>;
    /// Writes as much of `data` as fits, returning the count accepted.
    fn write(&mut self, sock: SocketHandle, data: &[u8]) -> Result<usize, NetError>;
    fn abort(&mut self, sock: SocketHandle);
}

// --- Firmware downloader (third-party library boundary) ---

/// Raw status from the downloader library; negative values are its
/// documented error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderError(pub i32);

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "downloader error {}", self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LoaderError {}

pub trait FirmwareLoader {
    /// Fetches the firmware version advertised at `url` via `conn_host`
    /// and `conn_port` (the proxy when one is configured).
    fn remote_version(
        &mut self,
        url: &str,
        conn_host: &str,
        conn_port: u16,
    ) -> Result<u32, LoaderError>;

    /// Downloads, burns and restarts into the new image. Returns only on
    /// failure.
    fn download_and_run(&mut self) -> LoaderError;
}
