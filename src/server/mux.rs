//! Session multiplexer
//!
//! The event loop at the heart of the concentrator: admits TCP clients,
//! couples the serial device lifecycle to the client count, fans device
//! output to every client, and routes each client's cleaned input into
//! the device while executing the in-band administrative commands.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::board::BoardName;
use super::session::{ClientEvent, ClientId, ClientSession};
use crate::config::Config;
use crate::constants::{BOARDNAME_MAX, CHANNEL_CAPACITY, LISTEN_BACKLOG};
use crate::error::{Error, Result};
use crate::escape::{esc_name, Command};
use crate::lockfile::access_rw;
use crate::serial::{DeviceBackend, DeviceChannels};
use crate::telnet;

const HELP_TEXT: &[u8] = b"\r\n\
Supported escape sequences:\r\n\
. - terminate connection\r\n\
B - send a BREAK to the device\r\n\
C - clear the screen\r\n\
E - exclusive access (kill other clients)\r\n\
R - reboot the target\r\n\
S - status\r\n\
T - tty reset\r\n\
1,5,3,2,9 - set port to (115200,57600,38400,19200,9600) bps\r\n\
? - this help page\r\n";

/// Why the multiplexer stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Shutdown was signaled (TERM/INT/HUP)
    Shutdown,
    /// The serial device reached EOF or a persistent read error
    DeviceGone,
}

enum Wake {
    Shutdown,
    Accept(std::io::Result<(TcpStream, SocketAddr)>),
    Device(Option<Bytes>),
    Client(Option<(ClientId, ClientEvent)>),
}

pub struct Server<D: DeviceBackend> {
    cfg: Config,
    listener: TcpListener,
    backend: D,
    /// Open iff at least one client is connected
    device: Option<DeviceChannels>,
    baud: u32,
    board: Box<dyn BoardName>,
    boardname: String,
    clients: HashMap<ClientId, ClientSession>,
    next_id: ClientId,
    events_tx: mpsc::Sender<(ClientId, ClientEvent)>,
    events_rx: mpsc::Receiver<(ClientId, ClientEvent)>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<D: DeviceBackend> Server<D> {
    /// Bind the listener and pre-flight the device path. The real device
    /// open is deferred to the first client.
    pub fn bind(
        cfg: Config,
        backend: D,
        board: Box<dyn BoardName>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self> {
        let listener = bind_listener(cfg.tcp_port)?;

        if !access_rw(&cfg.device) {
            return Err(Error::DevicePreflight {
                path: cfg.device.clone(),
            });
        }

        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let baud = cfg.baud;

        Ok(Self {
            cfg,
            listener,
            backend,
            device: None,
            baud,
            board,
            boardname: String::new(),
            clients: HashMap::new(),
            next_id: 0,
            events_tx,
            events_rx,
            shutdown_rx,
        })
    }

    /// Actual listening address (useful when bound to port 0)
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until shutdown is signaled or the device goes away.
    ///
    /// Within one wake-up, admission is serviced before device fan-out,
    /// which is serviced before client ingest.
    pub async fn run(mut self) -> Result<Exit> {
        loop {
            let wake = {
                let device_rx = self.device.as_mut().map(|d| &mut d.rx);
                tokio::select! {
                    biased;
                    _ = self.shutdown_rx.changed() => Wake::Shutdown,
                    res = self.listener.accept() => Wake::Accept(res),
                    chunk = recv_or_pending(device_rx) => Wake::Device(chunk),
                    ev = self.events_rx.recv() => Wake::Client(ev),
                }
            };

            match wake {
                Wake::Shutdown => {
                    tracing::info!("shutdown signaled, closing device and clients");
                    self.teardown();
                    return Ok(Exit::Shutdown);
                }
                Wake::Accept(Ok((stream, addr))) => self.admit(stream, addr),
                Wake::Accept(Err(e)) => tracing::warn!("accept failed: {}", e),
                Wake::Device(Some(chunk)) => self.fan_out(chunk),
                Wake::Device(None) => {
                    tracing::error!("serial device closed, disconnecting all clients");
                    self.teardown();
                    return Ok(Exit::DeviceGone);
                }
                Wake::Client(Some((id, ClientEvent::Data(chunk)))) => self.ingest(id, chunk)?,
                Wake::Client(Some((id, ClientEvent::Closed))) => self.disconnect(id),
                // we hold a sender, so the event channel cannot close
                Wake::Client(None) => unreachable!("client event channel closed"),
            }
        }
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;
        tracing::info!("CONNECT: client {} from {}", id, addr);

        let session = ClientSession::spawn(
            id,
            stream,
            self.cfg.escape,
            self.cfg.raw,
            self.events_tx.clone(),
        );
        if !session.raw {
            session.send(&telnet::CONNECT_PREAMBLE);
        }
        self.clients.insert(id, session);

        if self.clients.len() == 1 {
            if let Err(e) = self.open_device() {
                self.broadcast(open_failure_notice(&e).as_bytes());
                self.disconnect(id);
                return;
            }
        }

        if let Some(session) = self.clients.get(&id) {
            if !session.raw {
                let report = self.status_report(session);
                session.send(&report);
                session.send(b"\r\n");
            }
        }
    }

    fn disconnect(&mut self, id: ClientId) {
        if let Some(session) = self.clients.remove(&id) {
            tracing::info!("DISCONNECT: client {}", session.id);
            session.shutdown();
            if self.clients.is_empty() {
                self.close_device();
            }
        }
    }

    /// Disconnect everything; the device closes with the last client.
    fn teardown(&mut self) {
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.disconnect(id);
        }
        // no clients connected: the device was already closed, but be
        // explicit for the signal path
        self.close_device();
    }

    fn open_device(&mut self) -> Result<()> {
        let channels = self.backend.open(self.baud)?;
        self.device = Some(channels);
        Ok(())
    }

    fn close_device(&mut self) {
        if self.device.take().is_some() {
            self.backend.close();
        }
    }

    // =========================================================================
    // Data paths
    // =========================================================================

    /// Device chunk: scrub (non-raw), fan out, feed the board-name hook.
    fn fan_out(&mut self, chunk: Bytes) {
        let mut buf = chunk.to_vec();
        if !self.cfg.raw {
            telnet::scrub_egress(&mut buf);
        }
        for session in self.clients.values() {
            session.send(&buf);
        }
        if let Some(mut name) = self.board.observe(&buf) {
            let mut cut = BOARDNAME_MAX.min(name.len());
            while !name.is_char_boundary(cut) {
                cut -= 1;
            }
            name.truncate(cut);
            self.boardname = name;
        }
    }

    /// Client chunk: interpret, execute commands in stream order, then
    /// write the surviving literals to the device in one piece.
    fn ingest(&mut self, id: ClientId, chunk: Bytes) -> Result<()> {
        if self.cfg.raw {
            self.device_write(chunk);
            return Ok(());
        }

        let pass = match self.clients.get_mut(&id) {
            Some(session) => session.filter.feed(&chunk),
            None => return Ok(()),
        };

        for (arg, cmd) in pass.commands {
            tracing::info!("CMD: client {} arg '{}'", id, arg as char);
            match cmd {
                Command::Disconnect => {
                    // terminates this ingest pass, dropping its literals
                    self.disconnect(id);
                    return Ok(());
                }
                Command::Break => {
                    if let Err(e) = self.backend.send_break() {
                        tracing::warn!("BREAK failed: {}", e);
                    }
                }
                Command::ClearScreen => self.broadcast(b"\x1b[2J\x1b[1;1H"),
                Command::TtyReset => self.broadcast(b"\x1bc\x1b!p"),
                Command::Exclusive => self.exclusive(id),
                Command::Reboot => self.reboot(),
                Command::Status => {
                    if let Some(session) = self.clients.get(&id) {
                        let report = self.status_report(session);
                        session.send(&report);
                    }
                }
                Command::Help => {
                    if let Some(session) = self.clients.get(&id) {
                        session.send(HELP_TEXT);
                    }
                }
                Command::SetBaud(baud) => self.set_baud(baud)?,
            }
        }

        if !pass.bytes.is_empty() {
            self.device_write(Bytes::from(pass.bytes));
        }
        Ok(())
    }

    fn device_write(&mut self, data: Bytes) {
        if let Some(device) = &self.device {
            if device.tx.try_send(data).is_err() {
                tracing::debug!("device write queue full, dropping chunk");
            }
        }
    }

    // =========================================================================
    // Administrative commands
    // =========================================================================

    fn exclusive(&mut self, keep: ClientId) {
        let others: Vec<ClientId> = self
            .clients
            .keys()
            .copied()
            .filter(|&id| id != keep)
            .collect();
        for id in others {
            self.disconnect(id);
        }
    }

    fn reboot(&mut self) {
        match self.cfg.reboot_cmd.clone() {
            None => self.broadcast(b"Reboot command is unset\r\n"),
            Some(cmd) => {
                self.broadcast(b"\r\n*** REBOOTING TARGET\r\n");
                // operator-configured, trusted input, handed to a subshell
                // verbatim; the exit status is not propagated
                match std::process::Command::new("sh").arg("-c").arg(&cmd).spawn() {
                    Ok(mut child) => {
                        std::thread::spawn(move || {
                            let _ = child.wait();
                        });
                    }
                    Err(e) => tracing::warn!("reboot command failed to start: {}", e),
                }
            }
        }
    }

    fn set_baud(&mut self, baud: u32) -> Result<()> {
        self.backend.set_baud(baud)?;
        self.baud = baud;
        self.broadcast(format!("*** Baud rate set to {} bps\r\n", baud).as_bytes());
        Ok(())
    }

    // =========================================================================
    // Client-facing text
    // =========================================================================

    fn broadcast(&self, buf: &[u8]) {
        for session in self.clients.values() {
            session.send(buf);
        }
    }

    fn status_report(&self, session: &ClientSession) -> Vec<u8> {
        let board = if self.boardname.is_empty() {
            String::new()
        } else {
            format!(" {}", self.boardname)
        };

        let mut msg = format!(
            "\r\n*** Connected to {}{} at {} bps\r\n",
            self.cfg.device.display(),
            board,
            self.baud
        );
        if let Some(addr) = session.local_addr {
            msg.push_str(&format!("*** Host: {}:{}\r\n", addr.ip(), addr.port()));
        }
        if let Some(addr) = session.peer_addr {
            msg.push_str(&format!("*** Client: {}:{}\r\n", addr.ip(), addr.port()));
        }
        msg.push_str(&format!(
            "*** Other clients: {}\r\n",
            self.clients.len().saturating_sub(1)
        ));
        msg.push_str(&format!("*** For help: <{}> ?\r\n", esc_name(self.cfg.escape)));
        msg.into_bytes()
    }
}

/// What connected clients see when a device open fails
fn open_failure_notice(err: &Error) -> String {
    match err {
        Error::DeviceLocked { .. } => "\r\n*** Device is locked, disconnecting\r\n\r\n".to_string(),
        Error::DeviceOpen { source, .. } => {
            format!("*** Can't open device: {}\r\n", source)
        }
        other => format!("*** Can't open device: {}\r\n", other),
    }
}

async fn recv_or_pending(rx: Option<&mut mpsc::Receiver<Bytes>>) -> Option<Bytes> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// 0.0.0.0:<port> stream listener with address reuse, non-blocking.
fn bind_listener(port: u16) -> Result<TcpListener> {
    let bind_err = |source: std::io::Error| Error::Bind { port, source };

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    TcpListener::from_std(socket.into()).map_err(bind_err)
}
