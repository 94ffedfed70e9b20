//! Transport for the ASCII command gateway.
//!
//! The command engine itself is an external collaborator hidden behind
//! [`AsciiEngine`]; this module only moves bytes between it and one of
//! three endpoints: the process's stdio, a local (Unix) socket or a TCP
//! socket. Socket modes serve a single connection at a time: the listener
//! is armed one-shot on the multiplexer and re-armed whenever the current
//! connection goes away, by EOF, error or idle timeout.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use log::{debug, error, info, warn};
use nix::sys::epoll::{epoll_ctl, EpollEvent, EpollFlags, EpollOp};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::err::DriverError;
use crate::event_loop::EventLoop;
use crate::util;

/// Command interface selection, from the command line.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandInterface {
    Disabled,
    /// Read commands from stdin, write responses to stdout.
    Stdio,
    /// Local stream socket bound at a filesystem path.
    Local(PathBuf),
    /// TCP socket on the given port.
    Tcp(u16),
}

/// The opaque ASCII command engine the transport feeds.
pub trait AsciiEngine: Send {
    /// Free space in the engine's command buffer.
    fn write_space(&self) -> usize;
    /// Hand raw command bytes to the engine.
    fn feed(&mut self, data: &[u8]);
    /// Response bytes the engine wants shipped to the client.
    fn take_output(&mut self) -> Vec<u8>;
    /// One mirrored diagnostic line.
    fn log_line(&mut self, line: &str);
}

/// Address prefix injected for bare interactive commands on stdio.
const STDIO_PREFIX: &[u8] = b"[0] ";

/// Cap for a single read; commands are short lines.
const READ_BUF_SIZE: usize = 256;

enum Listener {
    None,
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl Listener {
    fn fd(&self) -> Option<RawFd> {
        match self {
            Listener::None => None,
            Listener::Tcp(l) => Some(l.as_raw_fd()),
            Listener::Unix(l, _) => Some(l.as_raw_fd()),
        }
    }
}

enum Connection {
    None,
    Stdio,
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Connection {
    fn read_fd(&self) -> Option<RawFd> {
        match self {
            Connection::None => None,
            Connection::Stdio => Some(libc::STDIN_FILENO),
            Connection::Tcp(s) => Some(s.as_raw_fd()),
            Connection::Unix(s) => Some(s.as_raw_fd()),
        }
    }

    fn write_fd(&self) -> Option<RawFd> {
        match self {
            Connection::None => None,
            Connection::Stdio => Some(libc::STDOUT_FILENO),
            Connection::Tcp(s) => Some(s.as_raw_fd()),
            Connection::Unix(s) => Some(s.as_raw_fd()),
        }
    }
}

pub struct GatewayTransport {
    epoll_fd: RawFd,
    mode: CommandInterface,
    listener: Listener,
    conn: Connection,
    idle_timeout_us: u64,
    idle_timer_us: u64,
    fresh_command: bool,
}

impl GatewayTransport {
    /// Set up the selected command interface and register it with the
    /// multiplexer behind `epoll_fd`. `idle_timeout_ms` of 0 disables the
    /// idle disconnect.
    pub fn new(
        epoll_fd: RawFd,
        mode: CommandInterface,
        idle_timeout_ms: u32,
    ) -> Result<Self, DriverError> {
        let mut gw = GatewayTransport {
            epoll_fd,
            mode: mode.clone(),
            listener: Listener::None,
            conn: Connection::None,
            idle_timeout_us: idle_timeout_ms as u64 * 1_000,
            idle_timer_us: 0,
            fresh_command: true,
        };

        match mode {
            CommandInterface::Disabled => {}
            CommandInterface::Stdio => {
                util::set_nonblocking(libc::STDIN_FILENO)?;
                gw.conn = Connection::Stdio;
                gw.register(libc::STDIN_FILENO, EpollFlags::EPOLLIN)?;
                info!("command interface on stdio");
            }
            CommandInterface::Local(path) => {
                let listener = UnixListener::bind(&path).map_err(|e| {
                    error!("binding local socket {} failed: {}", path.display(), e);
                    DriverError::Syscall(e)
                })?;
                listener.set_nonblocking(true)?;
                ignore_sigpipe()?;
                gw.register(
                    listener.as_raw_fd(),
                    EpollFlags::EPOLLIN | EpollFlags::EPOLLONESHOT,
                )?;
                info!("command interface on local socket {}", path.display());
                gw.listener = Listener::Unix(listener, path);
            }
            CommandInterface::Tcp(port) => {
                // std sets SO_REUSEADDR on unix TCP listeners
                let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|e| {
                    error!("binding tcp port {} failed: {}", port, e);
                    DriverError::Syscall(e)
                })?;
                listener.set_nonblocking(true)?;
                ignore_sigpipe()?;
                gw.register(
                    listener.as_raw_fd(),
                    EpollFlags::EPOLLIN | EpollFlags::EPOLLONESHOT,
                )?;
                info!("command interface on tcp port {}", port);
                gw.listener = Listener::Tcp(listener);
            }
        }

        Ok(gw)
    }

    pub fn is_enabled(&self) -> bool {
        self.mode != CommandInterface::Disabled
    }

    /// Bound TCP port, useful when port 0 was requested.
    pub fn local_tcp_port(&self) -> Option<u16> {
        match &self.listener {
            Listener::Tcp(l) => l.local_addr().ok().map(|a| a.port()),
            _ => None,
        }
    }

    /// Start of a command-session: the next bare line counts as fresh for
    /// the stdio prefix rule.
    pub fn reset_session(&mut self) {
        self.fresh_command = true;
    }

    /// Handle this tick's multiplexer event if it belongs to the gateway:
    /// accept a connection, read command bytes into the engine, or tear a
    /// dead connection down. Also advances the idle timeout.
    pub fn process(&mut self, ep: &mut EventLoop, engine: &mut dyn AsciiEngine) {
        if let Some((fd, flags)) = ep.pending_event() {
            if Some(fd) == self.listener.fd() {
                if flags.contains(EpollFlags::EPOLLIN) {
                    self.accept_connection();
                }
                ep.consume_event();
            } else if Some(fd) == self.conn.read_fd() {
                if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
                    debug!("gateway connection error/hangup, event {:?}", flags);
                    self.drop_connection();
                } else if flags.contains(EpollFlags::EPOLLIN) {
                    self.read_into_engine(engine);
                }
                ep.consume_event();
            }
        }

        // an established socket connection that stays silent is dropped
        // so the next client can connect
        if self.idle_timeout_us > 0
            && self.listener.fd().is_some()
            && self.conn.read_fd().is_some()
        {
            if self.idle_timer_us > self.idle_timeout_us {
                info!("gateway connection idle, closing");
                self.drop_connection();
            } else {
                self.idle_timer_us += ep.time_difference_us as u64;
            }
        }
    }

    /// Ship pending engine output to the connected client.
    pub fn flush(&mut self, engine: &mut dyn AsciiEngine) {
        let out = engine.take_output();
        if out.is_empty() {
            return;
        }
        if let Some(fd) = self.conn.write_fd() {
            match util::write_fd(fd, &out) {
                Ok(n) if n < out.len() => debug!("gateway response truncated at {} bytes", n),
                Ok(_) => {}
                Err(e) => debug!("gateway response write failed: {}", e),
            }
        }
    }

    fn accept_connection(&mut self) {
        let accepted: io::Result<Connection> = match &self.listener {
            Listener::Tcp(l) => l.accept().map(|(s, _)| Connection::Tcp(s)),
            Listener::Unix(l, _) => l.accept().map(|(s, _)| Connection::Unix(s)),
            Listener::None => return,
        };

        match accepted {
            Ok(conn) => {
                let fd = match conn.read_fd() {
                    Some(fd) => fd,
                    None => return,
                };
                let nonblocking = match &conn {
                    Connection::Tcp(s) => s.set_nonblocking(true),
                    Connection::Unix(s) => s.set_nonblocking(true),
                    _ => Ok(()),
                };
                if let Err(e) = nonblocking {
                    error!("gateway connection setup failed: {}", e);
                    self.rearm_accept();
                    return;
                }
                if let Err(e) = self.register(fd, EpollFlags::EPOLLIN) {
                    error!("registering gateway connection failed: {}", e);
                    self.rearm_accept();
                    return;
                }
                self.conn = conn;
                self.idle_timer_us = 0;
                self.fresh_command = true;
                debug!("gateway connection accepted");
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    error!("gateway accept failed: {}", e);
                }
                self.rearm_accept();
            }
        }
    }

    fn read_into_engine(&mut self, engine: &mut dyn AsciiEngine) {
        let fd = match self.conn.read_fd() {
            Some(fd) => fd,
            None => return,
        };

        let space = engine.write_space();
        let mut buf = [0u8; READ_BUF_SIZE];
        let cap = space.min(buf.len()).max(1);

        match util::read_fd(fd, &mut buf[..cap]) {
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    debug!("gateway read failed: {}", e);
                }
            }
            Ok(0) => {
                // EOF: close and accept the next client
                debug!("gateway connection closed by peer");
                self.drop_connection();
            }
            Ok(n) => {
                if space == 0 {
                    // engine busy; data is purged rather than blocking
                    warn!("gateway engine buffer full, {} bytes purged", n);
                } else if self.mode == CommandInterface::Stdio {
                    // make the hard-to-type sequence optional when a human
                    // types commands directly into the terminal
                    let closed = buf[n - 1] == b'\n';
                    if needs_address_prefix(&buf[..n], space - n, self.fresh_command) {
                        engine.feed(STDIO_PREFIX);
                    }
                    self.fresh_command = closed;
                    engine.feed(&buf[..n]);
                } else {
                    engine.feed(&buf[..n]);
                }
                self.idle_timer_us = 0;
            }
        }
    }

    fn drop_connection(&mut self) {
        if let Some(fd) = self.conn.read_fd() {
            let _ = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlDel, fd, None);
        }
        // dropping the stream closes its descriptor
        let _ = std::mem::replace(&mut self.conn, Connection::None);
        self.idle_timer_us = 0;
        self.rearm_accept();
    }

    fn rearm_accept(&mut self) {
        if let Some(fd) = self.listener.fd() {
            let mut ev = EpollEvent::new(
                EpollFlags::EPOLLIN | EpollFlags::EPOLLONESHOT,
                fd as u64,
            );
            if let Err(e) = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlMod, fd, &mut ev) {
                error!("re-arming gateway accept failed: {}", e);
            }
        }
    }

    fn register(&self, fd: RawFd, flags: EpollFlags) -> Result<(), DriverError> {
        let mut ev = EpollEvent::new(flags, fd as u64);
        epoll_ctl(self.epoll_fd, EpollOp::EpollCtlAdd, fd, &mut ev)?;
        Ok(())
    }
}

impl Drop for GatewayTransport {
    fn drop(&mut self) {
        if let Some(fd) = self.conn.read_fd() {
            let _ = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlDel, fd, None);
        }
        if let Some(fd) = self.listener.fd() {
            let _ = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlDel, fd, None);
        }
        if let Listener::Unix(_, path) = &self.listener {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("removing local socket {} failed: {}", path.display(), e);
            }
        }
    }
}

/// A broken client must not kill the daemon with SIGPIPE out of a write.
fn ignore_sigpipe() -> Result<(), DriverError> {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGPIPE, &action)?;
    }
    Ok(())
}

/// Whether a chunk of stdio input gets the `"[0] "` address prepended:
/// only a fresh, newline-terminated line that is printable, not a comment
/// and not already addressed, and only when the engine has room for the
/// prefix.
fn needs_address_prefix(buf: &[u8], space_after: usize, fresh: bool) -> bool {
    !buf.is_empty()
        && fresh
        && buf[0] != b'['
        && buf[0] != b'#'
        && buf[0].is_ascii_graphic()
        && buf[buf.len() - 1] == b'\n'
        && space_after >= STDIO_PREFIX.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct MockEngine {
        fed: Vec<u8>,
        output: Vec<u8>,
        space: usize,
    }

    impl MockEngine {
        fn shared(space: usize) -> Arc<Mutex<MockEngine>> {
            Arc::new(Mutex::new(MockEngine {
                space,
                ..Default::default()
            }))
        }
    }

    struct EngineHandle(Arc<Mutex<MockEngine>>);

    impl AsciiEngine for EngineHandle {
        fn write_space(&self) -> usize {
            self.0.lock().unwrap().space
        }
        fn feed(&mut self, data: &[u8]) {
            self.0.lock().unwrap().fed.extend_from_slice(data);
        }
        fn take_output(&mut self) -> Vec<u8> {
            std::mem::replace(&mut self.0.lock().unwrap().output, Vec::new())
        }
        fn log_line(&mut self, _line: &str) {}
    }

    #[test]
    fn address_prefix_rule() {
        // plain fresh command line gets the prefix
        assert!(needs_address_prefix(b"r 0x1018 0\n", 100, true));
        // already addressed
        assert!(!needs_address_prefix(b"[2] r 0x1018 0\n", 100, true));
        // comment
        assert!(!needs_address_prefix(b"# note\n", 100, true));
        // continuation of a longer command
        assert!(!needs_address_prefix(b"more args\n", 100, false));
        // not newline terminated yet
        assert!(!needs_address_prefix(b"r 0x1018", 100, true));
        // control character first
        assert!(!needs_address_prefix(b"\x07bell\n", 100, true));
        // no room for the prefix
        assert!(!needs_address_prefix(b"r\n", 3, true));
        assert!(!needs_address_prefix(b"", 100, true));
    }

    #[test]
    fn tcp_round_trip_and_reaccept() {
        let mut ep = EventLoop::new(10_000).unwrap();
        let mut gw =
            GatewayTransport::new(ep.epoll_fd(), CommandInterface::Tcp(0), 0).unwrap();
        let port = gw.local_tcp_port().unwrap();

        let engine = MockEngine::shared(1024);
        let mut handle = EngineHandle(Arc::clone(&engine));

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"r 0x1000 0\n").unwrap();

        // a few ticks: accept, then read
        for _ in 0..20 {
            ep.wait();
            gw.process(&mut ep, &mut handle);
            ep.process_last();
            if !engine.lock().unwrap().fed.is_empty() {
                break;
            }
        }
        assert_eq!(engine.lock().unwrap().fed, b"r 0x1000 0\n");

        // responses flow back over the same connection
        engine.lock().unwrap().output = b"[0] OK\n".to_vec();
        gw.flush(&mut handle);
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut response = [0u8; 16];
        let n = client.read(&mut response).unwrap();
        assert_eq!(&response[..n], b"[0] OK\n");

        // EOF re-arms the listener for the next client
        drop(client);
        for _ in 0..20 {
            ep.wait();
            gw.process(&mut ep, &mut handle);
            ep.process_last();
            if matches!(gw.conn, Connection::None) {
                break;
            }
        }

        let mut second = TcpStream::connect(("127.0.0.1", port)).unwrap();
        second.write_all(b"second\n").unwrap();
        for _ in 0..20 {
            ep.wait();
            gw.process(&mut ep, &mut handle);
            ep.process_last();
            if engine.lock().unwrap().fed.ends_with(b"second\n") {
                break;
            }
        }
        assert!(engine.lock().unwrap().fed.ends_with(b"second\n"));
    }

    #[test]
    fn idle_connection_is_dropped() {
        let mut ep = EventLoop::new(5_000).unwrap();
        let mut gw =
            GatewayTransport::new(ep.epoll_fd(), CommandInterface::Tcp(0), 30).unwrap();
        let port = gw.local_tcp_port().unwrap();

        let engine = MockEngine::shared(1024);
        let mut handle = EngineHandle(Arc::clone(&engine));

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();

        // tick until the idle timeout strikes
        for _ in 0..100 {
            ep.wait();
            gw.process(&mut ep, &mut handle);
            ep.process_last();
            if matches!(gw.conn, Connection::None) {
                break;
            }
        }
        assert!(matches!(gw.conn, Connection::None));

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 4];
        // server closed: EOF
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
