#![cfg_attr(not(feature = "std"), no_std)]

// 'alloc' is used for dynamic allocation (body buffers, config strings)
extern crate alloc;

#[cfg(test)]
extern crate std;

// --- Foundation Modules ---
pub mod types;
pub mod hal;
pub mod timeout;
pub mod crc;
pub mod report;
pub(crate) mod log;

// --- Persistent State ---
pub mod bb;
pub mod eeprom;
pub mod rtc;

// --- Network ---
pub mod lan;
pub mod post;
pub mod download;

// --- Weather Station ---
pub mod davis;

// --- Supervision & Glue ---
pub mod tasks;
pub mod node;

// --- Top-level Exports ---
pub use bb::Retained;
pub use davis::{CollectError, CollectStatus, Collector};
pub use eeprom::{ParamStore, EeError};
pub use hal::{Board, ConsoleIn, FirmwareLoader, MonotonicClock, NetInterface, NvMemory, RetainedRam, SerialPort, WallClock, Watchdog};
pub use lan::LanManager;
pub use node::{NodeExit, Platform, ResetKind, WxNode};
pub use post::{PostClient, PostError, PostStatus};
pub use report::{Flags, Reporter, Severity, Source};
pub use rtc::Rtc;
pub use tasks::{TaskError, TaskStatus, Tasks};
