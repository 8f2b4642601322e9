use std::io::{Read, Write as IoWrite};
use std::sync::mpsc::{Receiver, TryRecvError};

use wx_node::hal::ConsoleIn;

/// Keystroke input from stdin, drained through a reader thread so the
/// cooperative main loop never blocks.
pub struct StdinConsole {
    rx: Receiver<u8>,
}

impl StdinConsole {
    pub fn spawn() -> Self {
        let (tx, rx) = std::sync::mpsc::channel();

        std::thread::spawn(move || {
            let mut stdin = std::io::stdin();
            let mut byte = [0u8; 1];
            while stdin.read_exact(&mut byte).is_ok() {
                if tx.send(byte[0]).is_err() {
                    break;
                }
            }
        });

        StdinConsole { rx }
    }
}

impl ConsoleIn for StdinConsole {
    fn getc(&mut self) -> Option<u8> {
        match self.rx.try_recv() {
            Ok(b) => Some(b),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Report sink output onto stdout.
pub struct StdoutConsole;

impl core::fmt::Write for StdoutConsole {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let mut stdout = std::io::stdout();
        stdout.write_all(s.as_bytes()).map_err(|_| core::fmt::Error)?;
        stdout.flush().map_err(|_| core::fmt::Error)
    }
}
