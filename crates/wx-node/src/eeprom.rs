//! EEPROM parameter store.
//!
//! The EEPROM is treated as a page-addressed space (32-byte pages); each
//! logical parameter group occupies a known page index and is framed as
//! `{marker, payload, crc}` where the marker is the constant 0x55AA and
//! the CRC is CCITT-16 over marker + payload. A read that fails the
//! transport, the marker or the CRC leaves the caller with a zeroed
//! payload and a recomputed invalid flag; a write streams page-by-page
//! with a settle delay and finishes with a read-back compare.

use alloc::string::String;
use alloc::vec;
use core::fmt::{self, Write};
use core::net::Ipv4Addr;

use crate::crc::crc_calculate;
use crate::hal::{MonotonicClock, NvError, NvMemory};
use crate::lan::{LAN_DEF_DNS_SERVER, LAN_DEF_IP_ADDR, LAN_DEF_NETMASK, LAN_DEF_ROUTER};
use crate::log::my_debug;
use crate::report::{Flags, Reporter, Severity, Source};
use crate::timeout::MsDeadline;
use crate::report;

// Short-cut names for types of report output
const PROBLEM: Flags = Flags::new(Source::Eeprom, Severity::PROBLEM);
const INFO: Flags = Flags::new(Source::Eeprom, Severity::INFO);
const DETAIL: Flags = Flags::new(Source::Eeprom, Severity::DETAIL);

/// Maximum number of bytes which can be written in one device operation.
pub const EE_PAGE_SIZE: usize = 32;

/// Delay after each EEPROM page write.
const EE_WRITE_DELAY_MS: u16 = 50;

/// Magic number for the block marker field.
pub const EE_BLK_MARKER: u16 = 0x55AA;

const EE_MARKER_SIZE: usize = 2;
const EE_CRC_SIZE: usize = 2;

/// Minimum framed block size: marker, CRC and at least one payload byte.
pub const EE_BLK_MIN_SIZE: usize = EE_MARKER_SIZE + EE_CRC_SIZE + 1;

// 8-bit EEPROM page indices, multiplied by EE_PAGE_SIZE to give the
// physical subaddress.
pub const EE_LOC_LAN_INFO: u8 = 0;
pub const EE_LOC_POST_INFO: u8 = 1;
pub const EE_LOC_POST_HOST: u8 = 2; // Allow 4 pages
pub const EE_LOC_POST_PATH: u8 = 6; // Allow 4 pages
pub const EE_LOC_POST_PROXY: u8 = 10; // Allow 4 pages
pub const EE_LOC_UNIT_INFO: u8 = 14;

/// Maximum stored string length (excluding the terminator).
pub const EE_POST_STR_MAX_LEN: usize = 64;

// Default POST parameters
const EE_DEF_POST_HOST: &str = "ADD-POST-HOST-HERE";
const EE_DEF_POST_HOST_PORT: u16 = 80;
const EE_DEF_POST_PATH: &str = "/default.asp";
const EE_DEF_POST_PROXY: &str = "ADD-PROXY-HOST-HERE";
const EE_DEF_POST_PROXY_PORT: u16 = 80;

/// Classified failure of a block operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EeError {
    /// Transport failure from the byte driver (or read-back mismatch).
    Nv(NvError),
    /// The requested block is smaller than the framing allows.
    BadBlockSize,
    /// The stored marker did not match.
    BadMarker,
    /// The stored CRC did not match the calculated one.
    BadCrc,
}

impl fmt::Display for EeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nv(e) => write!(f, "EEPROM transport error: {}", e),
            Self::BadBlockSize => write!(f, "block size below minimum"),
            Self::BadMarker => write!(f, "block marker invalid"),
            Self::BadCrc => write!(f, "block CRC mismatch"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EeError {}

impl From<NvError> for EeError {
    fn from(e: NvError) -> Self {
        EeError::Nv(e)
    }
}

impl EeError {
    /// Transport-tier failures abort initialisation; semantic failures
    /// (marker/CRC) only invalidate the block.
    pub fn is_transport(self) -> bool {
        match self {
            EeError::Nv(e) => e.is_transport(),
            EeError::BadBlockSize => true,
            EeError::BadMarker | EeError::BadCrc => false,
        }
    }
}

/// Wire codec for a parameter block payload (the framing is shared).
pub trait BlockCodec: Sized + Default {
    /// Payload size, excluding marker and CRC.
    const PAYLOAD_LEN: usize;

    /// Serializes the payload into `buf` (exactly `PAYLOAD_LEN` bytes).
    fn encode_payload(&self, buf: &mut [u8]);

    /// Deserializes the payload from `buf` (exactly `PAYLOAD_LEN` bytes).
    fn decode_payload(buf: &[u8]) -> Self;
}

const fn framed_len(payload_len: usize) -> usize {
    EE_MARKER_SIZE + payload_len + EE_CRC_SIZE
}

/// Reads and validates one framed block.
pub fn read_block<T: BlockCodec>(
    nv: &mut impl NvMemory,
    loc: u8,
    rpt: &mut Reporter<impl Write>,
) -> Result<T, EeError> {
    let blk_size = framed_len(T::PAYLOAD_LEN);
    if blk_size < EE_BLK_MIN_SIZE {
        return Err(EeError::BadBlockSize); // Don't touch memory
    }

    let subaddr = loc as u16 * EE_PAGE_SIZE as u16;
    let mut buf = vec![0u8; blk_size];

    if let Err(e) = nv.read(subaddr, &mut buf) {
        report!(rpt, PROBLEM, "I2C read returned error value {}", e);
        return Err(e.into());
    }

    let marker = u16::from_le_bytes([buf[0], buf[1]]);
    if marker != EE_BLK_MARKER {
        report!(rpt, INFO, "Block at {} does not contain a valid marker", loc);
        return Err(EeError::BadMarker);
    }

    let info_size = blk_size - EE_CRC_SIZE;
    let crc_calc = crc_calculate(&buf[..info_size]);
    let crc_stored = u16::from_le_bytes([buf[info_size], buf[info_size + 1]]);

    if crc_stored != crc_calc {
        report!(
            rpt,
            INFO,
            "Block CRC {:04X} did not match calculated CRC {:04X}",
            crc_stored,
            crc_calc
        );
        return Err(EeError::BadCrc);
    }

    my_debug!("read of block {} succeeded", loc);
    Ok(T::decode_payload(&buf[EE_MARKER_SIZE..info_size]))
}

/// Writes one framed block page-by-page and verifies it by read-back.
pub fn write_block<T: BlockCodec>(
    nv: &mut impl NvMemory,
    clock: &impl MonotonicClock,
    loc: u8,
    value: &T,
    rpt: &mut Reporter<impl Write>,
) -> Result<(), EeError> {
    let blk_size = framed_len(T::PAYLOAD_LEN);
    if blk_size < EE_BLK_MIN_SIZE {
        return Err(EeError::BadBlockSize);
    }

    let info_size = blk_size - EE_CRC_SIZE;
    let mut buf = vec![0u8; blk_size];

    buf[0..EE_MARKER_SIZE].copy_from_slice(&EE_BLK_MARKER.to_le_bytes());
    value.encode_payload(&mut buf[EE_MARKER_SIZE..info_size]);

    let crc_calc = crc_calculate(&buf[..info_size]);
    buf[info_size..].copy_from_slice(&crc_calc.to_le_bytes());

    report!(rpt, DETAIL, "Wrote CRC {:04X} to block {}", crc_calc, loc);

    let mut subaddr = loc as u16 * EE_PAGE_SIZE as u16;
    for page in buf.chunks(EE_PAGE_SIZE) {
        if let Err(e) = nv.write(subaddr, page) {
            report!(rpt, PROBLEM, "I2C write returned error value {}", e);
            return Err(e.into());
        }

        // Device needs quiet time after each page write.
        let settle = MsDeadline::after(clock, EE_WRITE_DELAY_MS);
        while !settle.expired(clock) {}

        subaddr += page.len() as u16;
    }

    let subaddr = loc as u16 * EE_PAGE_SIZE as u16;
    if let Err(e) = nv.compare(subaddr, &buf) {
        report!(rpt, INFO, "I2C compare returned error value {}", e);
        return Err(e.into());
    }

    report!(rpt, DETAIL, "Write to block at {} succeeded", loc);
    Ok(())
}

/// Dumps a block to the console in hexadecimal, 16 columns per row.
pub fn dump_block(rpt: &mut Reporter<impl Write>, data: &[u8]) {
    for row in data.chunks(16) {
        for byte in row {
            report!(rpt, DETAIL.raw(), "{:02X} ", byte);
        }
        report!(rpt, DETAIL.raw(), "\r\n");
    }
}

// --- Parameter groups ---

/// LAN configuration block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanConfig {
    pub use_static: bool,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub router: Ipv4Addr,
}

impl Default for LanConfig {
    fn default() -> Self {
        LanConfig {
            use_static: false,
            ip: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            dns: Ipv4Addr::UNSPECIFIED,
            router: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl LanConfig {
    pub fn factory_default() -> Self {
        LanConfig {
            use_static: false,
            ip: LAN_DEF_IP_ADDR,
            netmask: LAN_DEF_NETMASK,
            dns: LAN_DEF_DNS_SERVER,
            router: LAN_DEF_ROUTER,
        }
    }
}

impl BlockCodec for LanConfig {
    const PAYLOAD_LEN: usize = 2 + 4 * 4;

    fn encode_payload(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&(self.use_static as u16).to_le_bytes());
        buf[2..6].copy_from_slice(&self.ip.octets());
        buf[6..10].copy_from_slice(&self.netmask.octets());
        buf[10..14].copy_from_slice(&self.dns.octets());
        buf[14..18].copy_from_slice(&self.router.octets());
    }

    fn decode_payload(buf: &[u8]) -> Self {
        let ip = |at: usize| Ipv4Addr::new(buf[at], buf[at + 1], buf[at + 2], buf[at + 3]);
        LanConfig {
            use_static: u16::from_le_bytes([buf[0], buf[1]]) != 0,
            ip: ip(2),
            netmask: ip(6),
            dns: ip(10),
            router: ip(14),
        }
    }
}

/// POST endpoint configuration block (the host, path and proxy strings are
/// stored as separate blocks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PostConfig {
    pub use_proxy: bool,
    pub host_port: u16,
    pub proxy_port: u16,
}

impl PostConfig {
    pub fn factory_default() -> Self {
        PostConfig {
            use_proxy: false,
            host_port: EE_DEF_POST_HOST_PORT,
            proxy_port: EE_DEF_POST_PROXY_PORT,
        }
    }
}

impl BlockCodec for PostConfig {
    const PAYLOAD_LEN: usize = 6;

    fn encode_payload(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&(self.use_proxy as u16).to_le_bytes());
        buf[2..4].copy_from_slice(&self.host_port.to_le_bytes());
        buf[4..6].copy_from_slice(&self.proxy_port.to_le_bytes());
    }

    fn decode_payload(buf: &[u8]) -> Self {
        PostConfig {
            use_proxy: u16::from_le_bytes([buf[0], buf[1]]) != 0,
            host_port: u16::from_le_bytes([buf[2], buf[3]]),
            proxy_port: u16::from_le_bytes([buf[4], buf[5]]),
        }
    }
}

/// A stored string block (host name, path or proxy host). At most 64
/// bytes; zero-padded on the wire with a guaranteed terminator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PostString {
    text: String,
}

impl PostString {
    /// Builds a stored string, discarding anything past the capacity.
    pub fn new(src: &str) -> Self {
        let mut text = String::new();
        for ch in src.chars() {
            if text.len() + ch.len_utf8() > EE_POST_STR_MAX_LEN {
                break;
            }
            text.push(ch);
        }
        PostString { text }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl BlockCodec for PostString {
    const PAYLOAD_LEN: usize = EE_POST_STR_MAX_LEN + 1;

    fn encode_payload(&self, buf: &mut [u8]) {
        buf.fill(0);
        let bytes = self.text.as_bytes();
        buf[..bytes.len()].copy_from_slice(bytes);
        // buf[EE_POST_STR_MAX_LEN] stays zero: terminator is guaranteed.
    }

    fn decode_payload(buf: &[u8]) -> Self {
        let terminated = &buf[..EE_POST_STR_MAX_LEN];
        let len = terminated
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(EE_POST_STR_MAX_LEN);
        let text = core::str::from_utf8(&terminated[..len]).unwrap_or("");
        PostString {
            text: String::from(text),
        }
    }
}

/// Unit identity and behaviour block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitConfig {
    pub id_base: u16,
    pub report_mode: u16,
    pub update_secs: u16,
    pub reserved: u16,
}

impl BlockCodec for UnitConfig {
    const PAYLOAD_LEN: usize = 8;

    fn encode_payload(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.id_base.to_le_bytes());
        buf[2..4].copy_from_slice(&self.report_mode.to_le_bytes());
        buf[4..6].copy_from_slice(&self.update_secs.to_le_bytes());
        buf[6..8].copy_from_slice(&self.reserved.to_le_bytes());
    }

    fn decode_payload(buf: &[u8]) -> Self {
        let word = |at: usize| u16::from_le_bytes([buf[at], buf[at + 1]]);
        UnitConfig {
            id_base: word(0),
            report_mode: word(2),
            update_secs: word(4),
            reserved: word(6),
        }
    }
}

// --- The store itself ---

/// All parameter groups plus their recomputed validity flags.
#[derive(Debug, Default)]
pub struct ParamStore {
    pub lan: LanConfig,
    pub lan_valid: bool,

    pub post: PostConfig,
    pub host: PostString,
    pub path: PostString,
    pub proxy: PostString,
    /// Composite: POST config, host and path blocks all valid, plus the
    /// proxy block when `use_proxy` is set.
    pub post_valid: bool,

    pub unit: UnitConfig,
}

impl ParamStore {
    /// Reads every group at start-up. If `write_defaults` is set (DIP
    /// switch), defaults are installed over invalid LAN/POST blocks only;
    /// a previously valid block is never overwritten at boot.
    ///
    /// Transport-tier errors abort with `Err`; semantic failures leave the
    /// affected group zeroed and invalid.
    pub fn init(
        nv: &mut impl NvMemory,
        clock: &impl MonotonicClock,
        write_defaults: bool,
        rpt: &mut Reporter<impl Write>,
    ) -> Result<Self, EeError> {
        let mut store = ParamStore::default();

        store.read_lan_params(nv, rpt)?;
        store.read_post_params(nv, rpt)?;
        store.read_unit_params(nv, rpt)?;

        report!(
            rpt,
            DETAIL,
            "lan_valid = {}, post_valid = {}",
            store.lan_valid,
            store.post_valid
        );

        if write_defaults {
            if !store.lan_valid {
                report!(rpt, INFO, "Writing default values to LAN parameters");
                store.write_lan_defaults(nv, clock, rpt)?;
                report!(rpt, DETAIL, "lan_valid = {}", store.lan_valid);
            }

            if !store.post_valid {
                report!(rpt, INFO, "Writing default values to POST parameters");
                store.write_post_defaults(nv, clock, rpt)?;
                report!(rpt, DETAIL, "post_valid = {}", store.post_valid);
            }
        }

        Ok(store)
    }

    fn read_group<T: BlockCodec>(
        nv: &mut impl NvMemory,
        loc: u8,
        rpt: &mut Reporter<impl Write>,
    ) -> Result<(T, bool), EeError> {
        match read_block::<T>(nv, loc, rpt) {
            Ok(value) => Ok((value, true)),
            Err(e) if e.is_transport() => Err(e),
            Err(_) => Ok((T::default(), false)),
        }
    }

    /// Re-reads the LAN group and recomputes its validity flag.
    pub fn read_lan_params(
        &mut self,
        nv: &mut impl NvMemory,
        rpt: &mut Reporter<impl Write>,
    ) -> Result<(), EeError> {
        let (lan, valid) = Self::read_group(nv, EE_LOC_LAN_INFO, rpt)?;
        self.lan = lan;
        self.lan_valid = valid;
        Ok(())
    }

    /// Re-reads the POST groups and recomputes the composite flag.
    pub fn read_post_params(
        &mut self,
        nv: &mut impl NvMemory,
        rpt: &mut Reporter<impl Write>,
    ) -> Result<(), EeError> {
        self.post_valid = false;

        let (post, info_valid) = Self::read_group(nv, EE_LOC_POST_INFO, rpt)?;
        let (host, host_valid): (PostString, bool) = Self::read_group(nv, EE_LOC_POST_HOST, rpt)?;
        let (path, path_valid): (PostString, bool) = Self::read_group(nv, EE_LOC_POST_PATH, rpt)?;
        let (proxy, proxy_valid): (PostString, bool) =
            Self::read_group(nv, EE_LOC_POST_PROXY, rpt)?;

        self.post = post;
        self.host = host;
        self.path = path;
        self.proxy = proxy;

        if info_valid && host_valid && path_valid {
            self.post_valid = !self.post.use_proxy || proxy_valid;
        }

        Ok(())
    }

    /// Re-reads the unit group. An invalid block simply reads as zeroes,
    /// which selects the DIP-switch behaviour everywhere it is used.
    pub fn read_unit_params(
        &mut self,
        nv: &mut impl NvMemory,
        rpt: &mut Reporter<impl Write>,
    ) -> Result<(), EeError> {
        let (unit, _valid): (UnitConfig, bool) = Self::read_group(nv, EE_LOC_UNIT_INFO, rpt)?;
        self.unit = unit;
        Ok(())
    }

    // Writers used by the configuration menu. Each one re-reads its group
    // afterwards so the validity flags always reflect stored state.

    pub fn write_lan_config(
        &mut self,
        nv: &mut impl NvMemory,
        clock: &impl MonotonicClock,
        rpt: &mut Reporter<impl Write>,
        cfg: &LanConfig,
    ) -> Result<(), EeError> {
        write_block(nv, clock, EE_LOC_LAN_INFO, cfg, rpt)?;
        self.read_lan_params(nv, rpt)
    }

    pub fn write_post_config(
        &mut self,
        nv: &mut impl NvMemory,
        clock: &impl MonotonicClock,
        rpt: &mut Reporter<impl Write>,
        cfg: &PostConfig,
    ) -> Result<(), EeError> {
        write_block(nv, clock, EE_LOC_POST_INFO, cfg, rpt)?;
        self.read_post_params(nv, rpt)
    }

    pub fn write_post_host(
        &mut self,
        nv: &mut impl NvMemory,
        clock: &impl MonotonicClock,
        rpt: &mut Reporter<impl Write>,
        host: &str,
    ) -> Result<(), EeError> {
        write_block(nv, clock, EE_LOC_POST_HOST, &PostString::new(host), rpt)?;
        self.read_post_params(nv, rpt)
    }

    pub fn write_post_path(
        &mut self,
        nv: &mut impl NvMemory,
        clock: &impl MonotonicClock,
        rpt: &mut Reporter<impl Write>,
        path: &str,
    ) -> Result<(), EeError> {
        write_block(nv, clock, EE_LOC_POST_PATH, &PostString::new(path), rpt)?;
        self.read_post_params(nv, rpt)
    }

    pub fn write_post_proxy(
        &mut self,
        nv: &mut impl NvMemory,
        clock: &impl MonotonicClock,
        rpt: &mut Reporter<impl Write>,
        proxy: &str,
    ) -> Result<(), EeError> {
        write_block(nv, clock, EE_LOC_POST_PROXY, &PostString::new(proxy), rpt)?;
        self.read_post_params(nv, rpt)
    }

    pub fn write_unit_config(
        &mut self,
        nv: &mut impl NvMemory,
        clock: &impl MonotonicClock,
        rpt: &mut Reporter<impl Write>,
        cfg: &UnitConfig,
    ) -> Result<(), EeError> {
        write_block(nv, clock, EE_LOC_UNIT_INFO, cfg, rpt)?;
        self.read_unit_params(nv, rpt)
    }

    pub fn write_lan_defaults(
        &mut self,
        nv: &mut impl NvMemory,
        clock: &impl MonotonicClock,
        rpt: &mut Reporter<impl Write>,
    ) -> Result<(), EeError> {
        self.write_lan_config(nv, clock, rpt, &LanConfig::factory_default())
    }

    pub fn write_post_defaults(
        &mut self,
        nv: &mut impl NvMemory,
        clock: &impl MonotonicClock,
        rpt: &mut Reporter<impl Write>,
    ) -> Result<(), EeError> {
        write_block(
            nv,
            clock,
            EE_LOC_POST_INFO,
            &PostConfig::factory_default(),
            rpt,
        )?;
        write_block(
            nv,
            clock,
            EE_LOC_POST_HOST,
            &PostString::new(EE_DEF_POST_HOST),
            rpt,
        )?;
        write_block(
            nv,
            clock,
            EE_LOC_POST_PATH,
            &PostString::new(EE_DEF_POST_PATH),
            rpt,
        )?;
        write_block(
            nv,
            clock,
            EE_LOC_POST_PROXY,
            &PostString::new(EE_DEF_POST_PROXY),
            rpt,
        )?;
        self.read_post_params(nv, rpt)
    }

    pub fn write_unit_defaults(
        &mut self,
        nv: &mut impl NvMemory,
        clock: &impl MonotonicClock,
        rpt: &mut Reporter<impl Write>,
    ) -> Result<(), EeError> {
        self.write_unit_config(nv, clock, rpt, &UnitConfig::default())
    }
}
