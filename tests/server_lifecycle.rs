//! End-to-end tests for the session multiplexer
//!
//! Drives the server over real TCP connections with a scripted mock
//! device backend standing in for the serial port, covering the device
//! lifecycle coupling, the telnet admission handshake, the in-band
//! command language, and the fan-out paths.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use ip2ser::config::Config;
use ip2ser::error::Error;
use ip2ser::serial::{DeviceBackend, DeviceChannels};
use ip2ser::server::{Exit, NoBoardName, Server};
use ip2ser::telnet;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const ESC: u8 = 0x1e;

// =============================================================================
// Mock device backend
// =============================================================================

#[derive(Default)]
struct MockState {
    open: bool,
    opens: u32,
    closes: u32,
    baud: u32,
    breaks: u32,
    /// Everything the server wrote to the device
    written: Vec<u8>,
    /// Injection point for device output
    to_clients: Option<mpsc::Sender<Bytes>>,
    /// Simulate a lock held by another process
    fail_locked: bool,
}

#[derive(Clone, Default)]
struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl DeviceBackend for MockDevice {
    fn open(&mut self, baud: u32) -> ip2ser::Result<DeviceChannels> {
        let mut st = self.state.lock().unwrap();
        if st.fail_locked {
            return Err(Error::DeviceLocked {
                path: PathBuf::from("/dev/ttyMOCK"),
            });
        }

        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(64);
        st.open = true;
        st.opens += 1;
        st.baud = baud;
        st.to_clients = Some(in_tx);

        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(chunk) = out_rx.recv().await {
                state.lock().unwrap().written.extend_from_slice(&chunk);
            }
        });

        Ok(DeviceChannels {
            rx: in_rx,
            tx: out_tx,
        })
    }

    fn set_baud(&mut self, baud: u32) -> ip2ser::Result<()> {
        self.state.lock().unwrap().baud = baud;
        Ok(())
    }

    fn send_break(&mut self) -> ip2ser::Result<()> {
        self.state.lock().unwrap().breaks += 1;
        Ok(())
    }

    fn close(&mut self) {
        let mut st = self.state.lock().unwrap();
        st.open = false;
        st.closes += 1;
        st.to_clients = None;
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    addr: SocketAddr,
    device: MockDevice,
    shutdown_tx: watch::Sender<bool>,
    server: JoinHandle<ip2ser::Result<Exit>>,
}

impl Harness {
    async fn start(raw: bool, reboot_cmd: Option<&str>) -> Self {
        let cfg = Config {
            device: PathBuf::from("/dev/null"),
            tcp_port: 0,
            baud: 115200,
            escape: ESC,
            raw,
            reboot_cmd: reboot_cmd.map(str::to_string),
        };
        let device = MockDevice::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server =
            Server::bind(cfg, device.clone(), Box::new(NoBoardName), shutdown_rx).unwrap();
        let addr = server.local_addr().unwrap();
        let server = tokio::spawn(server.run());

        Self {
            addr,
            device,
            shutdown_tx,
            server,
        }
    }

    async fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        settle().await;
        stream
    }

    /// Connect and drain the admission greeting
    async fn connect_drained(&self) -> TcpStream {
        let mut stream = self.connect().await;
        read_for(&mut stream, 100).await;
        stream
    }

    async fn inject(&self, data: &[u8]) {
        let tx = self.device.state.lock().unwrap().to_clients.clone().unwrap();
        tx.send(Bytes::copy_from_slice(data)).await.unwrap();
    }

    fn written(&self) -> Vec<u8> {
        self.device.state.lock().unwrap().written.clone()
    }

    fn opens(&self) -> u32 {
        self.device.state.lock().unwrap().opens
    }

    fn closes(&self) -> u32 {
        self.device.state.lock().unwrap().closes
    }

    fn is_open(&self) -> bool {
        self.device.state.lock().unwrap().open
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

/// Read until `ms` of silence or EOF
async fn read_for(stream: &mut TcpStream, ms: u64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match tokio::time::timeout(Duration::from_millis(ms), stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
            _ => break,
        }
    }
    out
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn single_client_echo() {
    let h = Harness::start(false, None).await;

    let mut client = h.connect().await;
    let greeting = read_for(&mut client, 100).await;
    assert!(greeting.starts_with(&telnet::CONNECT_PREAMBLE));
    let greeting = text(&greeting);
    assert!(greeting.contains("*** Connected to /dev/null at 115200 bps"));
    assert!(greeting.contains("*** Other clients: 0"));
    assert!(greeting.contains("*** For help: <Control-^> ?"));
    assert_eq!(h.opens(), 1);
    assert!(h.is_open());

    client.write_all(b"hello\r\n").await.unwrap();
    settle().await;
    assert_eq!(h.written(), b"hello\r");

    h.inject(b"hello\r\n").await;
    let echoed = read_for(&mut client, 100).await;
    assert_eq!(echoed, b"hello\r\n");

    drop(client);
    settle().await;
    assert!(!h.is_open());
    assert_eq!(h.closes(), 1);
}

#[tokio::test]
async fn telnet_client_admission() {
    let h = Harness::start(false, None).await;

    let mut client = h.connect().await;
    let greeting = read_for(&mut client, 100).await;
    assert_eq!(&greeting[..12], &telnet::CONNECT_PREAMBLE);

    // WON'T LFLOW, DO ECHO, then real input
    client.write_all(&[telnet::IAC, telnet::WONT, telnet::OPT_LFLOW]).await.unwrap();
    client.write_all(&[telnet::IAC, telnet::DO, telnet::OPT_ECHO]).await.unwrap();
    client.write_all(b"AB").await.unwrap();
    settle().await;

    assert_eq!(h.written(), b"AB");
}

#[tokio::test]
async fn exclusive_takeover_disconnects_others() {
    let h = Harness::start(false, None).await;

    let mut a = h.connect_drained().await;
    let mut b = h.connect_drained().await;
    let mut c = h.connect_drained().await;
    assert_eq!(h.opens(), 1);

    a.write_all(&[ESC, b'e']).await.unwrap();
    settle().await;

    // b and c see EOF; a stays up and the device stays open
    assert!(read_for(&mut b, 100).await.is_empty());
    assert!(read_for(&mut c, 100).await.is_empty());
    assert!(h.is_open());
    assert_eq!(h.closes(), 0);

    a.write_all(b"still here").await.unwrap();
    settle().await;
    assert_eq!(h.written(), b"still here");
}

#[tokio::test]
async fn baud_change_broadcasts_to_everyone() {
    let h = Harness::start(false, None).await;

    let mut a = h.connect_drained().await;
    let mut b = h.connect_drained().await;

    a.write_all(&[ESC, b'5']).await.unwrap();
    settle().await;

    assert_eq!(h.device.state.lock().unwrap().baud, 57600);
    let notice = "*** Baud rate set to 57600 bps\r\n";
    assert_eq!(text(&read_for(&mut a, 100).await), notice);
    assert_eq!(text(&read_for(&mut b, 100).await), notice);

    // subsequent status reports show the new rate
    a.write_all(&[ESC, b's']).await.unwrap();
    let status = text(&read_for(&mut a, 100).await);
    assert!(status.contains("at 57600 bps"));
    assert!(status.contains("*** Other clients: 1"));
}

#[tokio::test]
async fn escape_escape_reaches_device_once() {
    let h = Harness::start(false, None).await;

    let mut client = h.connect_drained().await;
    client.write_all(&[ESC, ESC]).await.unwrap();
    settle().await;

    assert_eq!(h.written(), vec![ESC]);
}

#[tokio::test]
async fn reboot_unset_vs_set() {
    let h = Harness::start(false, None).await;
    let mut client = h.connect_drained().await;
    client.write_all(&[ESC, b'r']).await.unwrap();
    assert_eq!(
        text(&read_for(&mut client, 100).await),
        "Reboot command is unset\r\n"
    );

    let h = Harness::start(false, Some("/bin/true")).await;
    let mut client = h.connect_drained().await;
    client.write_all(&[ESC, b'r']).await.unwrap();
    assert_eq!(
        text(&read_for(&mut client, 100).await),
        "\r\n*** REBOOTING TARGET\r\n"
    );
}

#[tokio::test]
async fn break_command_reaches_backend() {
    let h = Harness::start(false, None).await;
    let mut client = h.connect_drained().await;

    client.write_all(&[ESC, b'B']).await.unwrap();
    settle().await;

    assert_eq!(h.device.state.lock().unwrap().breaks, 1);
    assert!(h.written().is_empty());
}

#[tokio::test]
async fn help_goes_to_the_trigger_only() {
    let h = Harness::start(false, None).await;
    let mut a = h.connect_drained().await;
    let mut b = h.connect_drained().await;

    a.write_all(&[ESC, b'?']).await.unwrap();
    let help = text(&read_for(&mut a, 100).await);
    assert!(help.contains("Supported escape sequences"));
    assert!(help.contains(". - terminate connection"));
    assert!(read_for(&mut b, 100).await.is_empty());
}

#[tokio::test]
async fn self_disconnect_command() {
    let h = Harness::start(false, None).await;
    let mut client = h.connect_drained().await;

    client.write_all(&[b'x', ESC, b'.']).await.unwrap();
    settle().await;

    // the pass terminated: its literals never reach the device
    assert!(h.written().is_empty());
    assert!(read_for(&mut client, 100).await.is_empty());
    assert!(!h.is_open());
    assert_eq!(h.closes(), 1);
}

#[tokio::test]
async fn device_open_coupling_across_interleavings() {
    let h = Harness::start(false, None).await;

    let a = h.connect_drained().await;
    assert_eq!((h.opens(), h.closes()), (1, 0));

    let b = h.connect_drained().await;
    assert_eq!((h.opens(), h.closes()), (1, 0));

    drop(a);
    settle().await;
    assert!(h.is_open());
    assert_eq!((h.opens(), h.closes()), (1, 0));

    drop(b);
    settle().await;
    assert!(!h.is_open());
    assert_eq!((h.opens(), h.closes()), (1, 1));

    let _c = h.connect_drained().await;
    assert!(h.is_open());
    assert_eq!((h.opens(), h.closes()), (2, 1));
}

#[tokio::test]
async fn egress_never_carries_iac() {
    let h = Harness::start(false, None).await;
    let mut client = h.connect_drained().await;

    h.inject(&[0x41, telnet::IAC, 0x42]).await;
    let received = read_for(&mut client, 100).await;
    assert_eq!(received, vec![0x41, 0x7f, 0x42]);
}

#[tokio::test]
async fn locked_device_rejects_first_client() {
    let h = Harness::start(false, None).await;
    h.device.state.lock().unwrap().fail_locked = true;

    let mut client = h.connect().await;
    let output = read_for(&mut client, 100).await;
    let output = text(&output);
    assert!(output.contains("*** Device is locked, disconnecting"));
    assert_eq!(h.opens(), 0);

    // the server survives and accepts again once the lock clears
    h.device.state.lock().unwrap().fail_locked = false;
    let _client = h.connect_drained().await;
    assert_eq!(h.opens(), 1);
}

#[tokio::test]
async fn raw_mode_passes_everything_verbatim() {
    let h = Harness::start(true, None).await;

    let mut client = h.connect().await;
    // no preamble, no status report
    assert!(read_for(&mut client, 100).await.is_empty());

    let payload = [ESC, b'e', telnet::IAC, 0x00, 0x7f, 0x0d, 0x0a];
    client.write_all(&payload).await.unwrap();
    settle().await;
    assert_eq!(h.written(), payload);

    // no egress sanitation either
    h.inject(&[telnet::IAC, 0x41]).await;
    assert_eq!(read_for(&mut client, 100).await, vec![telnet::IAC, 0x41]);
}

#[tokio::test]
async fn signal_shutdown_closes_device_and_clients() {
    let h = Harness::start(false, None).await;
    let mut client = h.connect_drained().await;
    let device = h.device.clone();

    h.shutdown_tx.send(true).unwrap();
    let exit = h.server.await.unwrap().unwrap();
    assert_eq!(exit, Exit::Shutdown);
    assert!(!device.state.lock().unwrap().open);
    assert!(read_for(&mut client, 100).await.is_empty());
}

#[tokio::test]
async fn device_eof_is_fatal() {
    let h = Harness::start(false, None).await;
    let mut client = h.connect_drained().await;

    // simulate the device vanishing: drop the injection sender
    h.device.state.lock().unwrap().to_clients = None;

    let exit = h.server.await.unwrap().unwrap();
    assert_eq!(exit, Exit::DeviceGone);
    assert!(read_for(&mut client, 100).await.is_empty());
}
