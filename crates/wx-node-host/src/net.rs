use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use wx_node::hal::{
    DhcpInfo, IfConfig, IfState, LinkParams, NetError, NetInterface, ResolveHandle, ResolveStatus,
    SocketHandle,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct Conn {
    id: u32,
    stream: TcpStream,
    rx: Vec<u8>,
    eof: bool,
}

impl Conn {
    fn fill(&mut self) {
        let mut chunk = [0u8; 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => self.rx.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.eof = true;
                    break;
                }
            }
        }
    }
}

/// The firmware's view of the network, mapped onto the host stack. The
/// host OS owns the real interface, so bring-up is immediate and the
/// DHCP questions answer themselves.
pub struct HostNet {
    up: bool,
    dhcp: bool,
    next_handle: u32,
    resolved: HashMap<u32, ResolveStatus>,
    conn: Option<Conn>,
}

impl HostNet {
    pub fn new() -> Self {
        HostNet {
            up: false,
            dhcp: true,
            next_handle: 1,
            resolved: HashMap::new(),
            conn: None,
        }
    }

    fn conn_for(&mut self, sock: SocketHandle) -> Option<&mut Conn> {
        self.conn.as_mut().filter(|c| c.id == sock.0)
    }
}

impl Default for HostNet {
    fn default() -> Self {
        Self::new()
    }
}

impl NetInterface for HostNet {
    fn stack_init(&mut self) -> Result<(), NetError> {
        Ok(())
    }

    fn have_link(&mut self) -> bool {
        true
    }

    fn bring_up(&mut self, cfg: &IfConfig<'_>) -> Result<(), NetError> {
        log::info!(
            "interface up (dhcp={}, host name {:?})",
            cfg.dhcp,
            cfg.host_name
        );
        self.dhcp = cfg.dhcp;
        self.up = true;
        Ok(())
    }

    fn bring_down(&mut self) -> Result<(), NetError> {
        self.up = false;
        Ok(())
    }

    fn pending(&mut self) -> IfState {
        if self.up { IfState::Up } else { IfState::Down }
    }

    fn if_up(&mut self) -> bool {
        self.up
    }

    fn dhcp_ok(&mut self) -> bool {
        true
    }

    fn dhcp_fell_back(&mut self) -> Result<bool, NetError> {
        Ok(false)
    }

    fn dhcp_enabled(&mut self) -> bool {
        self.dhcp
    }

    fn set_fallback_servers(&mut self, dns: Ipv4Addr, router: Ipv4Addr) -> Result<(), NetError> {
        log::info!("fallback name server {} router {}", dns, router);
        Ok(())
    }

    fn local_ip(&mut self) -> Option<Ipv4Addr> {
        // A connected UDP socket reveals the outbound interface address
        // without sending a packet.
        let probe = UdpSocket::bind("0.0.0.0:0").ok()?;
        probe.connect("192.0.2.1:9").ok()?;
        match probe.local_addr().ok()? {
            SocketAddr::V4(addr) => Some(*addr.ip()),
            _ => None,
        }
    }

    fn link_params(&mut self) -> Option<LinkParams> {
        None // The host OS does not expose these portably.
    }

    fn dhcp_info(&mut self) -> Option<DhcpInfo> {
        None
    }

    fn tick(&mut self) {}

    fn resolve_start(&mut self, host: &str) -> Result<ResolveHandle, NetError> {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);

        // The host resolver is synchronous; the answer is simply held
        // until the state machine polls for it.
        let status = match (host, 0u16).to_socket_addrs() {
            Ok(addrs) => {
                let mut v4 = addrs.filter_map(|a| match a {
                    SocketAddr::V4(addr) => Some(*addr.ip()),
                    _ => None,
                });
                match v4.next() {
                    Some(ip) => ResolveStatus::Resolved(ip),
                    None => ResolveStatus::NoSuchHost,
                }
            }
            Err(_) => ResolveStatus::NoSuchHost,
        };

        self.resolved.insert(handle, status);
        Ok(ResolveHandle(handle))
    }

    fn resolve_check(&mut self, handle: ResolveHandle) -> ResolveStatus {
        self.resolved
            .get(&handle.0)
            .copied()
            .unwrap_or(ResolveStatus::Failed)
    }

    fn resolve_cancel(&mut self, handle: ResolveHandle) {
        self.resolved.remove(&handle.0);
    }

    fn open(&mut self, ip: Ipv4Addr, port: u16) -> Result<SocketHandle, NetError> {
        let addr = SocketAddr::from((ip, port));
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|_| NetError::Socket)?;
        stream.set_nonblocking(true).map_err(|_| NetError::Socket)?;
        stream.set_nodelay(true).map_err(|_| NetError::Socket)?;

        let id = self.conn.as_ref().map(|c| c.id).unwrap_or(0) + 1;
        self.conn = Some(Conn {
            id,
            stream,
            rx: Vec::new(),
            eof: false,
        });
        Ok(SocketHandle(id))
    }

    fn established(&mut self, sock: SocketHandle) -> bool {
        self.conn_for(sock).is_some()
    }

    fn alive(&mut self, sock: SocketHandle) -> bool {
        match self.conn_for(sock) {
            Some(conn) => {
                conn.fill();
                !(conn.eof && conn.rx.is_empty())
            }
            None => false,
        }
    }

    fn read_line(&mut self, sock: SocketHandle, buf: &mut [u8]) -> Option<usize> {
        let conn = self.conn_for(sock)?;
        conn.fill();

        let nl = conn.rx.iter().position(|&b| b == b'\n');
        let take = match nl {
            Some(at) => at + 1,
            // A trailing unterminated fragment still counts once the
            // peer has closed.
            None if conn.eof && !conn.rx.is_empty() => conn.rx.len(),
            None => return None,
        };

        let mut line: Vec<u8> = conn.rx.drain(..take).collect();
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }

        let len = line.len().min(buf.len());
        buf[..len].copy_from_slice(&line[..len]);
        Some(len)
    }

    fn write(&mut self, sock: SocketHandle, data: &[u8]) -> Result<usize, NetError> {
        let conn = self.conn_for(sock).ok_or(NetError::Send)?;
        match conn.stream.write(data) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(_) => Err(NetError::Send),
        }
    }

    fn abort(&mut self, sock: SocketHandle) {
        if self.conn_for(sock).is_some() {
            self.conn = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn serves_a_scripted_http_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut buf = [0u8; 512];
            let _ = peer.read(&mut buf).unwrap();
            peer.write_all(b"HTTP/1.1 200 OK\r\n\r\nSuccess!\r\n")
                .unwrap();
            // Dropping the stream closes the connection.
        });

        let mut net = HostNet::new();
        let ip = match addr {
            SocketAddr::V4(v4) => *v4.ip(),
            _ => unreachable!(),
        };

        let sock = net.open(ip, addr.port()).unwrap();
        assert!(net.established(sock));
        net.write(sock, b"POST / HTTP/1.1\r\n\r\nx=1").unwrap();

        let mut lines = Vec::new();
        let mut buf = [0u8; 128];
        for _ in 0..500 {
            if let Some(len) = net.read_line(sock, &mut buf) {
                lines.push(String::from_utf8_lossy(&buf[..len]).into_owned());
                if lines.len() == 3 {
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(lines, ["HTTP/1.1 200 OK", "", "Success!"]);

        // Once drained, the closed socket reads as dead.
        for _ in 0..500 {
            if !net.alive(sock) {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(!net.alive(sock));

        server.join().unwrap();
    }

    #[test]
    fn resolver_answers_localhost() {
        let mut net = HostNet::new();
        let handle = net.resolve_start("localhost").unwrap();
        match net.resolve_check(handle) {
            ResolveStatus::Resolved(ip) => assert!(ip.is_loopback()),
            other => panic!("unexpected resolve result: {:?}", other),
        }
    }
}
