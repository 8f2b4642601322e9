use wx_node::hal::{Board, DipSwitch, Led, LedColour};

/// Board stand-in for host runs: the front-panel LEDs become log lines,
/// the switches are read once from the environment.
///
/// `WX_DIP` is a four-character string of `0`/`1` (switches 1-4),
/// `WX_ROTARY` the station-ID offset `0..=15`.
pub struct EnvBoard {
    dips: [bool; 4],
    rotary: u8,
}

impl EnvBoard {
    pub fn from_env() -> Self {
        let dips = std::env::var("WX_DIP")
            .ok()
            .map(|s| {
                let mut dips = [false; 4];
                for (i, ch) in s.chars().take(4).enumerate() {
                    dips[i] = ch == '1';
                }
                dips
            })
            .unwrap_or([false; 4]);

        let rotary = std::env::var("WX_ROTARY")
            .ok()
            .and_then(|s| s.parse::<u8>().ok())
            .map(|v| v & 0x0F)
            .unwrap_or(0);

        EnvBoard { dips, rotary }
    }
}

impl Board for EnvBoard {
    fn set_led(&mut self, led: Led, colour: LedColour) {
        log::info!("LED {:?} -> {:?}", led, colour);
    }

    fn refresh_switches(&mut self) {
        // Environment switches cannot change at run time.
    }

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

    fn set_dtr(&mut self, asserted: bool) {
        log::debug!("DTR -> {}", asserted);
    }

    fn set_rts(&mut self, asserted: bool) {
        log::debug!("RTS -> {}", asserted);
    }
}
