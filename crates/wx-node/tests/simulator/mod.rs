// Shared simulator for the end-to-end scenarios: scripted fakes for the
// serial link to the weather station, the network stack, the EEPROM and
// the battery-backed RAM, plus manually stepped clocks.
#![allow(dead_code)]

use std::cell::Cell;
use std::collections::VecDeque;
use std::net::Ipv4Addr;

use wx_node::hal::{
    Board, ConsoleIn, DhcpInfo, DipSwitch, IfConfig, IfState, Led, LedColour, LinkParams,
    MonotonicClock, NetError, NvMemory, NvError, ResolveHandle, ResolveStatus, RetainedRam,
    SerialPort, SocketHandle, WallClock,
};

/// Manually stepped monotonic clock.
pub struct SimClock {
    ms: Cell<u32>,
}

impl SimClock {
    pub fn new() -> Self {
        SimClock { ms: Cell::new(0) }
    }

    pub fn advance_ms(&self, ms: u32) {
        self.ms.set(self.ms.get().wrapping_add(ms));
    }

    pub fn advance_secs(&self, secs: u32) {
        self.advance_ms(secs * 1000);
    }
}

impl MonotonicClock for SimClock {
    fn millis(&self) -> u32 {
        self.ms.get()
    }
    fn seconds(&self) -> u32 {
        self.ms.get() / 1000
    }
}

/// Settable wall clock.
pub struct SimWallClock {
    now: u32,
}

impl SimWallClock {
    pub fn at(now: u32) -> Self {
        SimWallClock { now }
    }
}

impl WallClock for SimWallClock {
    fn now(&self) -> u32 {
        self.now
    }
    fn set(&mut self, secs: u32) {
        self.now = secs;
    }
}

/// Scripted serial port: the test pushes the station's responses and
/// inspects everything the firmware wrote.
#[derive(Default)]
pub struct SimSerial {
    rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub error: bool,
}

impl SimSerial {
    pub fn push(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }
}

impl SerialPort for SimSerial {
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
        std::mem::take(&mut self.error)
    }
}

/// One scripted HTTP conversation: the response lines the "server" will
/// produce. The socket reads as alive until every line is consumed.
pub struct Conversation {
    lines: VecDeque<Vec<u8>>,
}

impl Conversation {
    pub fn new(lines: &[&str]) -> Self {
        Conversation {
            lines: lines.iter().map(|l| l.as_bytes().to_vec()).collect(),
        }
    }
}

/// Scripted network stack. Always-up interface; each `open` consumes the
/// next queued conversation.
pub struct SimNet {
    pub resolve_to: Ipv4Addr,
    pub resolve_count: usize,
    pub conversations: VecDeque<Conversation>,
    current: Option<Conversation>,
    pub written: Vec<u8>,
    pub opened: Vec<(Ipv4Addr, u16)>,
    pub local: Ipv4Addr,
}

impl SimNet {
    pub fn new() -> Self {
        SimNet {
            resolve_to: Ipv4Addr::new(203, 0, 113, 10),
            resolve_count: 0,
            conversations: VecDeque::new(),
            current: None,
            written: Vec::new(),
            opened: Vec::new(),
            local: Ipv4Addr::new(192, 168, 0, 100),
        }
    }

    pub fn queue_response(&mut self, lines: &[&str]) {
        self.conversations.push_back(Conversation::new(lines));
    }

    pub fn written_str(&self) -> String {
        String::from_utf8_lossy(&self.written).into_owned()
    }
}

impl wx_node::hal::NetInterface for SimNet {
    fn stack_init(&mut self) -> Result<(), NetError> {
        Ok(())
    }
    fn have_link(&mut self) -> bool {
        true
    }
    fn bring_up(&mut self, _cfg: &IfConfig<'_>) -> Result<(), NetError> {
        Ok(())
    }
    fn bring_down(&mut self) -> Result<(), NetError> {
        Ok(())
    }
    fn pending(&mut self) -> IfState {
        IfState::Up
    }
    fn if_up(&mut self) -> bool {
        true
    }
    fn dhcp_ok(&mut self) -> bool {
        true
    }
    fn dhcp_fell_back(&mut self) -> Result<bool, NetError> {
        Ok(false)
    }
    fn dhcp_enabled(&mut self) -> bool {
        true
    }
    fn set_fallback_servers(&mut self, _dns: Ipv4Addr, _router: Ipv4Addr) -> Result<(), NetError> {
        Ok(())
    }
    fn local_ip(&mut self) -> Option<Ipv4Addr> {
        Some(self.local)
    }
    fn link_params(&mut self) -> Option<LinkParams> {
        Some(LinkParams {
            ip: self.local,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            mac: [0x02, 0, 0, 0, 0, 0x42],
            mtu: 1500,
        })
    }
    fn dhcp_info(&mut self) -> Option<DhcpInfo> {
        None
    }
    fn tick(&mut self) {}

    fn resolve_start(&mut self, _host: &str) -> Result<ResolveHandle, NetError> {
        self.resolve_count += 1;
        Ok(ResolveHandle(1))
    }
    fn resolve_check(&mut self, _handle: ResolveHandle) -> ResolveStatus {
        ResolveStatus::Resolved(self.resolve_to)
    }
    fn resolve_cancel(&mut self, _handle: ResolveHandle) {}

    fn open(&mut self, ip: Ipv4Addr, port: u16) -> Result<SocketHandle, NetError> {
        self.opened.push((ip, port));
        self.current = self.conversations.pop_front();
        if self.current.is_none() {
            return Err(NetError::Socket);
        }
        Ok(SocketHandle(self.opened.len() as u32))
    }
    fn established(&mut self, _sock: SocketHandle) -> bool {
        self.current.is_some()
    }
    fn alive(&mut self, _sock: SocketHandle) -> bool {
        self.current
            .as_ref()
            .is_some_and(|c| !c.lines.is_empty())
    }
    fn read_line(&mut self, _sock: SocketHandle, buf: &mut [u8]) -> Option<usize> {
        let line = self.current.as_mut()?.lines.pop_front()?;
        buf[..line.len()].copy_from_slice(&line);
        Some(line.len())
    }
    fn write(&mut self, _sock: SocketHandle, data: &[u8]) -> Result<usize, NetError> {
        self.written.extend_from_slice(data);
        Ok(data.len())
    }
    fn abort(&mut self, _sock: SocketHandle) {
        self.current = None;
    }
}

/// In-memory EEPROM.
pub struct SimNv {
    pub mem: Vec<u8>,
}

impl SimNv {
    pub fn new() -> Self {
        SimNv {
            mem: vec![0xFF; 512],
        }
    }
}

impl NvMemory for SimNv {
    fn read(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), NvError> {
        let at = addr as usize;
        buf.copy_from_slice(&self.mem[at..at + buf.len()]);
        Ok(())
    }
    fn write(&mut self, addr: u16, data: &[u8]) -> Result<(), NvError> {
        let at = addr as usize;
        self.mem[at..at + data.len()].copy_from_slice(data);
        Ok(())
    }
    fn compare(&mut self, addr: u16, data: &[u8]) -> Result<(), NvError> {
        let at = addr as usize;
        if &self.mem[at..at + data.len()] == data {
            Ok(())
        } else {
            Err(NvError::CompareMismatch)
        }
    }
}

/// Battery-backed RAM image; clone it across a simulated reset.
#[derive(Clone, Default)]
pub struct SimRetainedRam {
    pub image: Vec<u8>,
}

impl RetainedRam for SimRetainedRam {
    fn load(&mut self, buf: &mut [u8]) {
        if self.image.len() == buf.len() {
            buf.copy_from_slice(&self.image);
        } else {
            buf.fill(0);
        }
    }
    fn store(&mut self, data: &[u8]) {
        self.image = data.to_vec();
    }
}

/// Board fake: remembers LED states, switches set by the test.
pub struct SimBoard {
    pub leds: [(Led, LedColour); 4],
    pub dips: [bool; 4],
    pub rotary: u8,
}

impl SimBoard {
    pub fn new() -> Self {
        SimBoard {
            leds: [
                (Led::Lan, LedColour::Off),
                (Led::Station, LedColour::Off),
                (Led::Post, LedColour::Off),
                (Led::Download, LedColour::Off),
            ],
            dips: [false; 4],
            rotary: 0,
        }
    }

    pub fn led(&self, which: Led) -> LedColour {
        self.leds
            .iter()
            .find(|(led, _)| *led == which)
            .map(|(_, colour)| *colour)
            .unwrap()
    }
}

impl Board for SimBoard {
    fn set_led(&mut self, led: Led, colour: LedColour) {
        for slot in self.leds.iter_mut() {
            if slot.0 == led {
                slot.1 = colour;
            }
        }
    }
    fn refresh_switches(&mut self) {}
    fn dip(&self, switch: DipSwitch) -> bool {
        let idx = match switch {
            DipSwitch::UdpDebug => 0,
            DipSwitch::VerboseReports => 1,
            DipSwitch::SlowCollect => 2,
            DipSwitch::WriteDefaults => 3,
        };
        self.dips[idx]
    }
    fn rotary(&self) -> u8 {
        self.rotary
    }
    fn set_dtr(&mut self, _asserted: bool) {}
    fn set_rts(&mut self, _asserted: bool) {}
}

/// Scripted operator console.
#[derive(Default)]
pub struct SimConsole {
    pub keys: VecDeque<u8>,
}

impl ConsoleIn for SimConsole {
    fn getc(&mut self) -> Option<u8> {
        self.keys.pop_front()
    }
}
