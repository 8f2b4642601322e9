//! Firmware self-update over HTTP.
//!
//! The actual transfer and flash programming belong to a third-party
//! downloader behind the [`FirmwareLoader`] trait; this module owns the
//! wrapper contract: URL construction (absolute when proxied), the
//! version comparison against the running firmware, the operator
//! reporting and the download LED.

use alloc::format;
use alloc::string::String;
use core::fmt::Write;

use crate::eeprom::{ParamStore, EE_POST_STR_MAX_LEN};
use crate::hal::{Board, FirmwareLoader, Led, LedColour, LoaderError};
use crate::report::{Flags, Reporter, Severity, Source};
use crate::types::version_code;
use crate::report;

// Short-cut names for types of report output
const PROBLEM: Flags = Flags::new(Source::Download, Severity::PROBLEM);
const INFO: Flags = Flags::new(Source::Download, Severity::INFO);
const DETAIL: Flags = Flags::new(Source::Download, Severity::DETAIL);

/// Default path to the update description file on the server.
pub const DL_DEF_PATH: &str = "/update.html";

const DL_HTTP_HDR: &str = "http://";

/// Checks the update server for a newer firmware version.
///
/// `send_full_url` forces an absolute URL in the request even without a
/// proxy (some servers require it); in proxy mode the absolute form is
/// always used. Returns `Ok(true)` when an updated version is
/// available.
pub fn check_for_update(
    loader: &mut impl FirmwareLoader,
    board: &mut impl Board,
    rpt: &mut Reporter<impl Write>,
    store: &ParamStore,
    web_host: &str,
    path: &str,
    send_full_url: bool,
) -> Result<bool, LoaderError> {
    if web_host.len() > EE_POST_STR_MAX_LEN {
        return Err(LoaderError(-20));
    }

    if path.len() > EE_POST_STR_MAX_LEN {
        return Err(LoaderError(-21));
    }

    let url: String = if store.post.use_proxy || send_full_url {
        format!("{}{}{}", DL_HTTP_HDR, web_host, path)
    } else {
        String::from(path)
    };

    let (conn_host, conn_port) = if store.post.use_proxy {
        (store.proxy.as_str(), store.post.proxy_port)
    } else {
        (web_host, 80)
    };

    report!(rpt, INFO, "Checking for new firmware...");
    report!(rpt, DETAIL, "Attempting connection to {} port {}", conn_host, conn_port);
    report!(rpt, DETAIL, "Attempting to get {}", url);

    board.set_led(Led::Download, LedColour::Amber);

    let version = match loader.remote_version(&url, conn_host, conn_port) {
        Ok(v) => v,
        Err(e) => {
            board.set_led(Led::Download, LedColour::Red);
            report!(rpt, PROBLEM, "Version check failed with {}", e.0);
            return Err(e);
        }
    };

    board.set_led(Led::Download, LedColour::Green);
    report!(rpt, INFO, "Update server advertises version {}", version);

    if version <= version_code() {
        report!(rpt, INFO, "Current firmware is up-to-date");
        return Ok(false);
    }

    report!(rpt, INFO, "Updated firmware is available");
    Ok(true)
}

/// Attempts to download, burn into flash and run a new firmware image.
///
/// Does not return on success (the loader restarts into the new code);
/// the returned error carries the downloader's status otherwise.
pub fn apply_update(
    loader: &mut impl FirmwareLoader,
    board: &mut impl Board,
    rpt: &mut Reporter<impl Write>,
) -> LoaderError {
    report!(rpt, INFO, "Attempting to download new firmware...");

    board.set_led(Led::Download, LedColour::Amber);

    let err = loader.download_and_run();

    board.set_led(Led::Download, LedColour::Red);
    report!(rpt, PROBLEM, "Downloader returned {}", err.0);
    report!(rpt, PROBLEM, "Firmware download not completed");

    err
}
