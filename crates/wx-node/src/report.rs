//! Operator report output, filtered by (source, severity).
//!
//! Every subsystem tags its console output with a source and a severity;
//! the active mode selects which (source, severity) pairs reach the
//! console. The mode comes from the stored unit configuration when it
//! names one, otherwise from the verbose-reports DIP switch.

use core::fmt::{self, Write};

/// Number of selectable reporting modes.
pub const REPORT_NUM_MODES: usize = 2;

/// Subsystem originating a report. The label is what the operator sees as
/// the line prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Source {
    Main = 0,
    Tasks = 1,
    Eeprom = 2,
    Lan = 3,
    Davis = 4,
    Post = 5,
    Download = 6,
}

impl Source {
    pub fn label(self) -> &'static str {
        match self {
            Source::Main => "MAIN",
            Source::Tasks => "TASKS",
            Source::Eeprom => "EEPROM",
            Source::Lan => "NET",
            Source::Davis => "SER",
            Source::Post => "UP",
            Source::Download => "DL",
        }
    }
}

/// Severity bit mask. A report carries exactly one bit; the enable tables
/// hold the union of severities allowed through per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Severity(pub u8);

impl Severity {
    pub const AFFIRM: Self = Self(0x80);
    pub const PROBLEM: Self = Self(0x40);
    pub const INFO: Self = Self(0x20);
    pub const DETAIL: Self = Self(0x10);

    /// All severities enabled.
    pub const ALL: Self = Self(0xF0);

    /// Checks whether any of the bits in `other` are set.
    pub fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }
}

/// A report tag: source plus severity, with an optional raw marker that
/// suppresses the `SOURCE: ` prefix and the trailing newline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub source: Source,
    pub severity: Severity,
    pub raw: bool,
}

impl Flags {
    pub const fn new(source: Source, severity: Severity) -> Self {
        Flags {
            source,
            severity,
            raw: false,
        }
    }

    pub const fn raw(self) -> Self {
        Flags { raw: true, ..self }
    }
}

// Enable masks per mode and source.
// Do not reorder without reviewing the Source discriminants.
const ENABLE: [[Severity; 8]; REPORT_NUM_MODES] = [
    // Terse format (switch OFF / mode 1)
    [
        Severity::ALL,
        Severity::ALL,
        Severity(Severity::PROBLEM.0 | Severity::INFO.0),
        Severity(Severity::PROBLEM.0 | Severity::INFO.0),
        Severity(Severity::PROBLEM.0 | Severity::INFO.0),
        Severity(Severity::PROBLEM.0 | Severity::INFO.0),
        Severity(Severity::PROBLEM.0 | Severity::INFO.0),
        Severity(Severity::PROBLEM.0 | Severity::INFO.0),
    ],
    // Verbose format (switch ON / mode 2)
    [
        Severity::ALL,
        Severity::ALL,
        Severity::ALL,
        Severity::ALL,
        Severity::ALL,
        Severity::ALL,
        Severity::ALL,
        Severity::ALL,
    ],
];

/// Mode selection state: the stored report mode (1-based; 0 or out of
/// range defers to the DIP switch) and the current switch sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportFilter {
    mode_select: u16,
    verbose_switch: bool,
}

impl ReportFilter {
    pub fn set_mode(&mut self, mode_select: u16, verbose_switch: bool) {
        self.mode_select = mode_select;
        self.verbose_switch = verbose_switch;
    }

    /// Whether a report tagged `flags` is currently enabled.
    pub fn enabled(&self, flags: Flags) -> bool {
        let sel = self.mode_select.wrapping_sub(1) as usize;
        let mode = if sel < REPORT_NUM_MODES {
            sel
        } else {
            self.verbose_switch as usize
        };
        ENABLE[mode][flags.source as usize].intersects(flags.severity)
    }
}

/// The report sink: applies the filter and formats enabled reports onto
/// the console writer.
pub struct Reporter<W: Write> {
    pub out: W,
    filter: ReportFilter,
    no_nl_next: bool,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Reporter {
            out,
            filter: ReportFilter::default(),
            no_nl_next: false,
        }
    }

    /// Updates the mode selection (stored unit value plus switch sample).
    pub fn set_mode(&mut self, mode_select: u16, verbose_switch: bool) {
        self.filter.set_mode(mode_select, verbose_switch);
    }

    /// Whether a report tagged `flags` would currently be emitted. Used to
    /// gate multi-line raw displays.
    pub fn enabled(&self, flags: Flags) -> bool {
        self.filter.enabled(flags)
    }

    /// Suppresses the newline at the end of the next report only (no
    /// effect on raw output, which carries no newline anyway).
    pub fn suppress_next_newline(&mut self) {
        self.no_nl_next = true;
    }

    /// Emits a report if its (source, severity) pair is enabled.
    pub fn report(&mut self, flags: Flags, args: fmt::Arguments<'_>) {
        if self.filter.enabled(flags) {
            if !flags.raw {
                let _ = write!(self.out, "{}: ", flags.source.label());
                if flags.severity.intersects(Severity::PROBLEM) {
                    let _ = self.out.write_str("ERROR - ");
                }
            }
            let _ = self.out.write_fmt(args);
            if !flags.raw && !self.no_nl_next {
                let _ = self.out.write_str("\r\n");
            }
        }
        self.no_nl_next = false;
    }
}

/// Emits an operator report through a [`Reporter`].
#[macro_export]
macro_rules! report {
    ($rpt:expr, $flags:expr, $($arg:tt)*) => {
        $rpt.report($flags, core::format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    fn reporter() -> Reporter<String> {
        Reporter::new(String::new())
    }

    const TASKS_DETAIL: Flags = Flags::new(Source::Tasks, Severity::DETAIL);
    const POST_DETAIL: Flags = Flags::new(Source::Post, Severity::DETAIL);
    const POST_PROBLEM: Flags = Flags::new(Source::Post, Severity::PROBLEM);

    #[test]
    fn terse_mode_keeps_tasks_detail_but_drops_post_detail() {
        let mut rpt = reporter();
        rpt.set_mode(0, false);

        report!(rpt, TASKS_DETAIL, "tick");
        report!(rpt, POST_DETAIL, "hidden");
        report!(rpt, POST_PROBLEM, "lost socket");

        assert_eq!(rpt.out, "TASKS: tick\r\nUP: ERROR - lost socket\r\n");
    }

    #[test]
    fn stored_mode_overrides_switch() {
        let mut rpt = reporter();
        rpt.set_mode(2, false); // verbose via stored value, switch off

        report!(rpt, POST_DETAIL, "shown");
        assert_eq!(rpt.out, "UP: shown\r\n");

        rpt.out.clear();
        rpt.set_mode(7, false); // out of range defers to switch (terse)
        report!(rpt, POST_DETAIL, "hidden");
        assert_eq!(rpt.out, "");
    }

    #[test]
    fn raw_flag_drops_prefix_and_newline() {
        let mut rpt = reporter();
        rpt.set_mode(2, false);

        report!(rpt, POST_PROBLEM.raw(), "partial");
        assert_eq!(rpt.out, "partial");
    }

    #[test]
    fn newline_suppression_is_one_shot() {
        let mut rpt = reporter();
        rpt.set_mode(2, false);

        rpt.suppress_next_newline();
        report!(rpt, TASKS_DETAIL, "head ");
        report!(rpt, TASKS_DETAIL.raw(), "tail");
        report!(rpt, TASKS_DETAIL, "next");

        assert_eq!(rpt.out, "TASKS: head tailTASKS: next\r\n");
    }

    #[test]
    fn suppression_is_consumed_even_when_filtered_out() {
        let mut rpt = reporter();
        rpt.set_mode(0, false); // terse: POST detail filtered

        rpt.suppress_next_newline();
        report!(rpt, POST_DETAIL, "dropped");
        report!(rpt, TASKS_DETAIL, "line");

        assert_eq!(rpt.out, "TASKS: line\r\n");
    }
}
