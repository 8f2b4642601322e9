// =============================================
// Logging Macros (namespaced under crate::log)
// =============================================
//
// Internal diagnostic traces for the state machines, layered on the `log`
// facade. Operator-facing output goes through the report sink instead
// (see `report.rs`); these records exist for developers attaching a host
// logger such as `env_logger`.

// ===== my_warn! =====
macro_rules! my_warn {
    ($fmt:literal $(, $($arg:tt)+)?) => {{
        log::warn!($fmt $(, $($arg)+)?);
    }};
}

// ===== my_debug! =====
macro_rules! my_debug {
    ($fmt:literal $(, $($arg:tt)+)?) => {{
        log::debug!($fmt $(, $($arg)+)?);
    }};
}

// ===== my_trace! =====
macro_rules! my_trace {
    ($fmt:literal $(, $($arg:tt)+)?) => {{
        log::trace!($fmt $(, $($arg)+)?);
    }};
}

// Re-export macros for use in other files
pub(crate) use my_warn;
pub(crate) use my_debug;
pub(crate) use my_trace;
