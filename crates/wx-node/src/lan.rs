//! LAN connection management (Ethernet and IP).
//!
//! Bring-up tries DHCP (or the stored static configuration) up to five
//! times, asking the stack for static fallback on the final attempt, and
//! backs off between attempts while watching the physical link. After a
//! successful start the supervisor polls `check_ok` every idle tick.

use core::fmt::Write;
use core::net::Ipv4Addr;

use crate::eeprom::LanConfig;
use crate::hal::{Board, IfConfig, IfState, Led, LedColour, MonotonicClock, NetInterface};
use crate::log::my_warn;
use crate::report::{Flags, Reporter, Severity, Source};
use crate::timeout::SecsDeadline;
use crate::report;

// Short-cut names for types of report output
const PROBLEM: Flags = Flags::new(Source::Lan, Severity::PROBLEM);
const INFO: Flags = Flags::new(Source::Lan, Severity::INFO);
const DETAIL: Flags = Flags::new(Source::Lan, Severity::DETAIL);

// Default LAN parameters (used as fallback on DHCP failure)
pub const LAN_DEF_IP_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 100);
pub const LAN_DEF_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
pub const LAN_DEF_DNS_SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 254);
pub const LAN_DEF_ROUTER: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 254);

// Timeout values
const DHCP_TOUT_SECS: u16 = 6; // DHCP server response time-out
const MAX_IF_UP_SECS: u32 = 30; // Maximum time for IP interface to start
const IF_BACK_OFF_SECS: u32 = 17; // Back-off time prior to IP interface retry
const HOLD_OFF_SECS: u32 = 120; // Hold-off time after IP interface failure

const IF_MAX_RETRIES: u8 = 5; // Maximum retries to bring interface up

/// Failure starting the LAN interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanStartError {
    /// Socket layer failed to initialise.
    SockInit,
    /// The stored LAN parameter block is invalid.
    InvalidParams,
    /// The stack rejected an interface configuration call.
    IfConfig,
    /// The interface reported it cannot come up.
    IfUp,
    /// The interface did not come up within the allowed time.
    IfUpTimeout,
    /// The Ethernet link dropped during the back-off wait.
    EthDisconnected,
}

/// Failure from the idle-tick liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanCheckError {
    /// Physical Ethernet link lost.
    EthDown,
    /// IP interface has gone down.
    IfDown,
    /// DHCP lease has expired.
    DhcpDown,
}

#[derive(Debug, Default)]
pub struct LanManager {
    /// Interface is up and usable.
    pub active: bool,
    dhcp_used: bool,
}

impl LanManager {
    pub fn new() -> Self {
        LanManager::default()
    }

    /// Attempts to bring up the LAN interface. Waits forever for the
    /// Ethernet link to appear before configuring.
    pub fn start(
        &mut self,
        net: &mut impl NetInterface,
        clock: &impl MonotonicClock,
        board: &mut impl Board,
        rpt: &mut Reporter<impl Write>,
        cfg: &LanConfig,
        cfg_valid: bool,
        host_name: &str,
    ) -> Result<(), LanStartError> {
        self.active = false;

        if net.stack_init().is_err() {
            report!(rpt, PROBLEM, "Socket layer initialisation failed");
            board.set_led(Led::Lan, LedColour::Red);
            return Err(LanStartError::SockInit);
        }

        while !net.have_link() {}

        report!(rpt, DETAIL, "Ethernet connection is active");
        board.set_led(Led::Lan, LedColour::Amber);

        if !cfg_valid {
            report!(rpt, PROBLEM, "EEPROM parameters for LAN are invalid");
            board.set_led(Led::Lan, LedColour::Red);
            return Err(LanStartError::InvalidParams);
        }

        let mut retry_ctr = IF_MAX_RETRIES;

        loop {
            let if_cfg = if cfg.use_static {
                self.dhcp_used = false;
                IfConfig {
                    dhcp: false,
                    dhcp_timeout_secs: 0,
                    dhcp_fallback: false,
                    ip: cfg.ip,
                    netmask: cfg.netmask,
                    dns: Some(cfg.dns),
                    router: Some(cfg.router),
                    host_name,
                }
            } else {
                self.dhcp_used = true;
                IfConfig {
                    dhcp: true,
                    dhcp_timeout_secs: DHCP_TOUT_SECS,
                    // Only the last attempt is allowed to fall back.
                    dhcp_fallback: retry_ctr == 1,
                    ip: LAN_DEF_IP_ADDR,
                    netmask: LAN_DEF_NETMASK,
                    dns: None,
                    router: None,
                    host_name,
                }
            };

            if net.bring_up(&if_cfg).is_err() {
                report!(rpt, PROBLEM, "Interface configuration (UP) failed");
                board.set_led(Led::Lan, LedColour::Red);
                return Err(LanStartError::IfConfig);
            }

            match self.await_if_result(net, clock, rpt) {
                Ok(()) => break,
                Err(e) => {
                    retry_ctr -= 1;
                    if retry_ctr == 0 {
                        report!(rpt, PROBLEM, "Maximum retries exceeded");
                        board.set_led(Led::Lan, LedColour::Red);
                        return Err(e);
                    }

                    report!(rpt, INFO, "Retrying in {} seconds...", IF_BACK_OFF_SECS);

                    if net.bring_down().is_err() {
                        report!(rpt, PROBLEM, "Interface configuration (DOWN) failed");
                        board.set_led(Led::Lan, LedColour::Red);
                        return Err(LanStartError::IfConfig);
                    }

                    let back_off = SecsDeadline::after(clock, IF_BACK_OFF_SECS);
                    while !back_off.expired(clock) {
                        net.tick();

                        if !net.have_link() {
                            report!(rpt, DETAIL, "Ethernet connection has gone down");
                            board.set_led(Led::Lan, LedColour::Off);
                            return Err(LanStartError::EthDisconnected);
                        }
                    }

                    report!(rpt, INFO, "Retrying...");
                }
            }
        }

        self.check_fallback(net, board, rpt)?;

        self.active = true; // Success!
        Ok(())
    }

    /// Waits for the interface to come up or to fail to come up.
    fn await_if_result(
        &mut self,
        net: &mut impl NetInterface,
        clock: &impl MonotonicClock,
        rpt: &mut Reporter<impl Write>,
    ) -> Result<(), LanStartError> {
        let tout = SecsDeadline::after(clock, MAX_IF_UP_SECS);

        loop {
            net.tick();

            match net.pending() {
                IfState::Up => return Ok(()),
                IfState::ComingUp => {}
                IfState::Down => {
                    report!(rpt, PROBLEM, "Unable to bring up LAN interface");
                    return Err(LanStartError::IfUp);
                }
            }

            if tout.expired(clock) {
                report!(rpt, PROBLEM, "Timed out waiting for interface to come up");
                return Err(LanStartError::IfUpTimeout);
            }
        }
    }

    /// Checks and reports the DHCP fallback status after bring-up. A
    /// fallback start still counts as started, but shows red on the LAN
    /// LED and amber on the POST LED so the operator can tell it apart.
    fn check_fallback(
        &mut self,
        net: &mut impl NetInterface,
        board: &mut impl Board,
        rpt: &mut Reporter<impl Write>,
    ) -> Result<(), LanStartError> {
        if self.dhcp_used {
            let fell_back = match net.dhcp_fell_back() {
                Ok(v) => v,
                Err(_) => {
                    report!(rpt, PROBLEM, "Unable to read DHCP fallback state");
                    board.set_led(Led::Lan, LedColour::Red);
                    return Err(LanStartError::IfConfig);
                }
            };

            if fell_back {
                report!(rpt, PROBLEM, "DHCP failed -- LAN interface in fallback mode");

                self.dhcp_used = false;

                if net
                    .set_fallback_servers(LAN_DEF_DNS_SERVER, LAN_DEF_ROUTER)
                    .is_err()
                {
                    report!(rpt, PROBLEM, "Unable to set fallback name server and router");
                    board.set_led(Led::Lan, LedColour::Red);
                    return Err(LanStartError::IfConfig);
                }

                board.set_led(Led::Lan, LedColour::Red);
                board.set_led(Led::Post, LedColour::Amber);
                return Ok(());
            }
        }

        report!(rpt, DETAIL, "Started LAN interface okay");
        board.set_led(Led::Lan, LedColour::Green);
        Ok(())
    }

    /// Checks that the LAN interface is still usable. Clears `active` and
    /// updates the LAN LED on failure.
    pub fn check_ok(
        &mut self,
        net: &mut impl NetInterface,
        board: &mut impl Board,
        rpt: &mut Reporter<impl Write>,
    ) -> Result<(), LanCheckError> {
        if !net.have_link() {
            self.active = false;
            report!(rpt, PROBLEM, "Ethernet interface has gone down");
            board.set_led(Led::Lan, LedColour::Off);
            return Err(LanCheckError::EthDown);
        }

        if !net.if_up() {
            self.active = false;
            report!(rpt, PROBLEM, "IP interface has gone down");
            board.set_led(Led::Lan, LedColour::Red);
            return Err(LanCheckError::IfDown);
        }

        if self.dhcp_used && !net.dhcp_ok() {
            self.active = false;
            report!(rpt, PROBLEM, "DHCP lease has expired");
            board.set_led(Led::Lan, LedColour::Red);
            return Err(LanCheckError::DhcpDown);
        }

        Ok(())
    }

    /// Waits out the hold-off time, or returns early if the Ethernet link
    /// goes down while waiting.
    pub fn hold_off(
        &self,
        net: &mut impl NetInterface,
        clock: &impl MonotonicClock,
        board: &mut impl Board,
    ) {
        let tout = SecsDeadline::after(clock, HOLD_OFF_SECS);

        while !tout.expired(clock) {
            net.tick();

            if !net.have_link() {
                board.set_led(Led::Lan, LedColour::Off);
                return;
            }
        }
    }

    /// Own IP address in network order, or the unspecified address if the
    /// interface cannot report one.
    pub fn network_ip(net: &mut impl NetInterface) -> Ipv4Addr {
        match net.local_ip() {
            Some(ip) => ip,
            None => {
                my_warn!("interface could not report its IP address");
                Ipv4Addr::UNSPECIFIED
            }
        }
    }

    /// Displays the LAN configuration summary if reports of the given
    /// severity are enabled for this source.
    pub fn show_info(
        &self,
        net: &mut impl NetInterface,
        rpt: &mut Reporter<impl Write>,
        cfg: &LanConfig,
        severity: Severity,
    ) {
        let flags = Flags::new(Source::Lan, severity).raw();
        if !rpt.enabled(flags) {
            return;
        }

        let dhcp = net.dhcp_enabled();
        let fell_back = net.dhcp_fell_back().unwrap_or(false);

        if !dhcp {
            report!(rpt, flags, "Static IP configuration (DHCP disabled)\r\n");
        } else if !fell_back {
            report!(
                rpt,
                flags,
                "DHCP enabled (Lease {})\r\n",
                if net.dhcp_ok() { "OK" } else { "EXPIRED" }
            );
        } else {
            report!(rpt, flags, "Fallback static IP configuration (DHCP failed)\r\n");
        }

        match net.link_params() {
            Some(p) => {
                report!(rpt, flags, "My IP address: {}\r\n", p.ip);
                report!(rpt, flags, "Network mask:  {}\r\n", p.netmask);
                report!(
                    rpt,
                    flags,
                    "MAC address:   {:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}\r\n",
                    p.mac[0],
                    p.mac[1],
                    p.mac[2],
                    p.mac[3],
                    p.mac[4],
                    p.mac[5]
                );
                report!(rpt, flags, "Ethernet MTU:  {}\r\n", p.mtu);
            }
            None => {
                report!(rpt, flags, "Unable to read LAN parms\r\n\r\n");
            }
        }

        if !dhcp {
            // Static values are not included in the link summary.
            report!(rpt, flags, "DNS server:    {}\r\n", cfg.dns);
            report!(rpt, flags, "Router:        {}\r\n", cfg.router);
        } else if fell_back {
            report!(rpt, flags, "DNS server:    {}\r\n", LAN_DEF_DNS_SERVER);
            report!(rpt, flags, "Router:        {}\r\n", LAN_DEF_ROUTER);
        } else if let Some(info) = net.dhcp_info() {
            report!(rpt, flags, "DHCP server:   {}\r\n", info.server);
            for dns in info.dns.iter().filter(|ip| !ip.is_unspecified()) {
                report!(rpt, flags, "DNS server:    {}\r\n", dns);
            }
            for router in info.routers.iter().filter(|ip| !ip.is_unspecified()) {
                report!(rpt, flags, "Router:        {}\r\n", router);
            }
            report!(
                rpt,
                flags,
                "DHCP lease:    {} (t1 = {}, t2 = {})\r\n",
                info.lease_secs,
                info.t1_secs,
                info.t2_secs
            );
        } else {
            report!(rpt, flags, "Unable to read DHCP parms\r\n");
        }

        report!(rpt, flags, "\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{DhcpInfo, LinkParams, NetError, ResolveHandle, ResolveStatus, SocketHandle};
    use alloc::string::String;
    use core::cell::Cell;

    struct TestClock {
        ms: Cell<u32>,
    }

    impl MonotonicClock for TestClock {
        fn millis(&self) -> u32 {
            let v = self.ms.get();
            self.ms.set(v.wrapping_add(500));
            v
        }
        fn seconds(&self) -> u32 {
            self.millis() / 1000
        }
    }

    #[derive(Default)]
    struct FakeBoard {
        lan_led: Option<LedColour>,
        post_led: Option<LedColour>,
    }

    impl Board for FakeBoard {
        fn set_led(&mut self, led: Led, colour: LedColour) {
            match led {
                Led::Lan => self.lan_led = Some(colour),
                Led::Post => self.post_led = Some(colour),
                _ => {}
            }
        }
        fn refresh_switches(&mut self) {}
        fn dip(&self, _switch: crate::hal::DipSwitch) -> bool {
            false
        }
        fn rotary(&self) -> u8 {
            0
        }
        fn set_dtr(&mut self, _asserted: bool) {}
        fn set_rts(&mut self, _asserted: bool) {}
    }

    /// Scripted interface: each bring-up attempt consumes one outcome.
    struct FakeNet {
        link: bool,
        outcomes: alloc::vec::Vec<IfState>,
        attempt: usize,
        fell_back: bool,
        up: bool,
        dhcp_ok: bool,
        fallback_configs: alloc::vec::Vec<bool>,
    }

    impl FakeNet {
        fn with_outcomes(outcomes: alloc::vec::Vec<IfState>) -> Self {
            FakeNet {
                link: true,
                outcomes,
                attempt: 0,
                fell_back: false,
                up: true,
                dhcp_ok: true,
                fallback_configs: alloc::vec::Vec::new(),
            }
        }
    }

    impl NetInterface for FakeNet {
        fn stack_init(&mut self) -> Result<(), NetError> {
            Ok(())
        }
        fn have_link(&mut self) -> bool {
            self.link
        }
        fn bring_up(&mut self, cfg: &IfConfig<'_>) -> Result<(), NetError> {
            self.fallback_configs.push(cfg.dhcp_fallback);
            Ok(())
        }
        fn bring_down(&mut self) -> Result<(), NetError> {
            Ok(())
        }
        fn pending(&mut self) -> IfState {
            let state = self.outcomes[self.attempt.min(self.outcomes.len() - 1)];
            if state != IfState::ComingUp {
                self.attempt += 1;
            }
            state
        }
        fn if_up(&mut self) -> bool {
            self.up
        }
        fn dhcp_ok(&mut self) -> bool {
            self.dhcp_ok
        }
        fn dhcp_fell_back(&mut self) -> Result<bool, NetError> {
            Ok(self.fell_back)
        }
        fn dhcp_enabled(&mut self) -> bool {
            true
        }
        fn set_fallback_servers(&mut self, _dns: Ipv4Addr, _router: Ipv4Addr) -> Result<(), NetError> {
            Ok(())
        }
        fn local_ip(&mut self) -> Option<Ipv4Addr> {
            Some(Ipv4Addr::new(192, 168, 0, 100))
        }
        fn link_params(&mut self) -> Option<LinkParams> {
            None
        }
        fn dhcp_info(&mut self) -> Option<DhcpInfo> {
            None
        }
        fn tick(&mut self) {}
        fn resolve_start(&mut self, _host: &str) -> Result<ResolveHandle, NetError> {
            Err(NetError::Resolver)
        }
        fn resolve_check(&mut self, _handle: ResolveHandle) -> ResolveStatus {
            ResolveStatus::Failed
        }
        fn resolve_cancel(&mut self, _handle: ResolveHandle) {}
        fn open(&mut self, _ip: Ipv4Addr, _port: u16) -> Result<SocketHandle, NetError> {
            Err(NetError::Socket)
        }
        fn established(&mut self, _sock: SocketHandle) -> bool {
            false
        }
        fn alive(&mut self, _sock: SocketHandle) -> bool {
            false
        }
        fn read_line(&mut self, _sock: SocketHandle, _buf: &mut [u8]) -> Option<usize> {
            None
        }
        fn write(&mut self, _sock: SocketHandle, _data: &[u8]) -> Result<usize, NetError> {
            Err(NetError::Send)
        }
        fn abort(&mut self, _sock: SocketHandle) {}
    }

    fn harness() -> (TestClock, FakeBoard, Reporter<String>) {
        (
            TestClock { ms: Cell::new(0) },
            FakeBoard::default(),
            Reporter::new(String::new()),
        )
    }

    #[test]
    fn clean_start_sets_green_led() {
        let (clock, mut board, mut rpt) = harness();
        let mut net = FakeNet::with_outcomes(alloc::vec![IfState::Up]);
        let mut lan = LanManager::new();

        let result = lan.start(
            &mut net,
            &clock,
            &mut board,
            &mut rpt,
            &LanConfig::factory_default(),
            true,
            "weather-42",
        );

        assert_eq!(result, Ok(()));
        assert!(lan.active);
        assert_eq!(board.lan_led, Some(LedColour::Green));
        assert_eq!(net.fallback_configs, alloc::vec![false]);
    }

    #[test]
    fn invalid_params_refuse_bring_up() {
        let (clock, mut board, mut rpt) = harness();
        let mut net = FakeNet::with_outcomes(alloc::vec![IfState::Up]);
        let mut lan = LanManager::new();

        let result = lan.start(
            &mut net,
            &clock,
            &mut board,
            &mut rpt,
            &LanConfig::default(),
            false,
            "weather-0",
        );

        assert_eq!(result, Err(LanStartError::InvalidParams));
        assert!(!lan.active);
    }

    #[test]
    fn fallback_is_requested_only_on_final_attempt() {
        let (clock, mut board, mut rpt) = harness();
        // Four failed attempts, then success on the fifth.
        let mut net = FakeNet::with_outcomes(alloc::vec![
            IfState::Down,
            IfState::Down,
            IfState::Down,
            IfState::Down,
            IfState::Up,
        ]);
        let mut lan = LanManager::new();

        let result = lan.start(
            &mut net,
            &clock,
            &mut board,
            &mut rpt,
            &LanConfig::factory_default(),
            true,
            "weather-1",
        );

        assert_eq!(result, Ok(()));
        assert_eq!(
            net.fallback_configs,
            alloc::vec![false, false, false, false, true]
        );
    }

    #[test]
    fn dhcp_fallback_start_marks_post_led_amber() {
        let (clock, mut board, mut rpt) = harness();
        let mut net = FakeNet::with_outcomes(alloc::vec![IfState::Up]);
        net.fell_back = true;
        let mut lan = LanManager::new();

        let result = lan.start(
            &mut net,
            &clock,
            &mut board,
            &mut rpt,
            &LanConfig::factory_default(),
            true,
            "weather-2",
        );

        assert_eq!(result, Ok(()));
        assert!(lan.active);
        assert_eq!(board.lan_led, Some(LedColour::Red));
        assert_eq!(board.post_led, Some(LedColour::Amber));
    }

    #[test]
    fn check_ok_classifies_failures() {
        let (_clock, mut board, mut rpt) = harness();
        let mut net = FakeNet::with_outcomes(alloc::vec![IfState::Up]);
        let mut lan = LanManager::new();
        lan.active = true;
        lan.dhcp_used = true;

        net.dhcp_ok = false;
        assert_eq!(
            lan.check_ok(&mut net, &mut board, &mut rpt),
            Err(LanCheckError::DhcpDown)
        );

        lan.active = true;
        net.up = false;
        assert_eq!(
            lan.check_ok(&mut net, &mut board, &mut rpt),
            Err(LanCheckError::IfDown)
        );

        lan.active = true;
        net.link = false;
        assert_eq!(
            lan.check_ok(&mut net, &mut board, &mut rpt),
            Err(LanCheckError::EthDown)
        );
        assert!(!lan.active);
    }
}
