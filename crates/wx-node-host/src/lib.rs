//! Standard-library implementations of the `wx-node` HAL for running the
//! firmware core on a host: the weather station is reached through a
//! serial-over-TCP bridge (a ser2net-style terminal server), the network
//! interface maps onto the host stack, and the EEPROM and battery-backed
//! RAM live in plain files.

pub mod board;
pub mod clock;
pub mod console;
pub mod error;
pub mod net;
pub mod serial;
pub mod storage;

pub use board::EnvBoard;
pub use clock::{HostClock, HostWallClock};
pub use console::{StdinConsole, StdoutConsole};
pub use error::HostError;
pub use net::HostNet;
pub use serial::TcpSerial;
pub use storage::{FileNv, FileRetainedRam};
