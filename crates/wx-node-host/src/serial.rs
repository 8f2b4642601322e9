use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;

use wx_node::hal::SerialPort;

/// The weather-station serial line, carried over TCP to a ser2net-style
/// terminal server that owns the physical 19,200 bps 8N1 port.
pub struct TcpSerial {
    stream: TcpStream,
    rx: VecDeque<u8>,
    error: bool,
}

impl TcpSerial {
    pub fn connect(addr: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        Ok(TcpSerial {
            stream,
            rx: VecDeque::new(),
            error: false,
        })
    }

    /// Moves whatever the bridge has delivered into the receive buffer.
    fn fill(&mut self) {
        let mut chunk = [0u8; 256];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    // Bridge closed the connection: latch an error, the
                    // collector treats it like a UART fault.
                    self.error = true;
                    break;
                }
                Ok(n) => self.rx.extend(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.error = true;
                    break;
                }
            }
        }
    }
}

impl SerialPort for TcpSerial {
    fn getc(&mut self) -> Option<u8> {
        self.fill();
        self.rx.pop_front()
    }

    fn recv_count(&mut self) -> usize {
        self.fill();
        self.rx.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.fill();
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
        let mut remaining = bytes;
        while !remaining.is_empty() {
            match self.stream.write(remaining) {
                Ok(n) => remaining = &remaining[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.error = true;
                    break;
                }
            }
        }
    }

    fn flush_input(&mut self) {
        self.fill();
        self.rx.clear();
    }

    fn flush_output(&mut self) {
        let _ = self.stream.flush();
    }

    fn take_error(&mut self) -> bool {
        std::mem::take(&mut self.error)
    }
}
