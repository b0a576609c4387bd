//! In-process SAM bridge for tests
//!
//! Speaks enough of SAM v3 to exercise the client without a router:
//! HELLO, SESSION CREATE, STREAM CONNECT/ACCEPT (piped between sessions
//! on the same fake bridge), NAMING LOOKUP, DEST GENERATE and datagrams.

use crate::i2p::identity::{b32_address, encode_destination, public_destination};
use crate::i2p::sam_client::SamConfig;
use crate::i2p::sam_reply::SamReply;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

/// Build a syntactically valid destination: 384 key bytes, a null
/// certificate and `private_len` trailing private-key bytes
pub fn fake_destination(seed: u8, private_len: usize) -> String {
    let mut bytes = vec![seed; 384];
    bytes.extend_from_slice(&[0, 0, 0]);
    bytes.extend(std::iter::repeat(seed ^ 0xff).take(private_len));
    encode_destination(&bytes)
}

#[derive(Default)]
struct FakeState {
    hello_reply: Mutex<String>,
    connect_wait: Mutex<Duration>,
    /// session id -> public destination
    sessions: Mutex<HashMap<String, String>>,
    /// b32 address -> parked STREAM ACCEPT sockets
    acceptors: Mutex<HashMap<String, VecDeque<TcpStream>>>,
    commands: Mutex<Vec<String>>,
    datagrams: Mutex<Vec<Vec<u8>>>,
    seed: AtomicU8,
}

impl FakeState {
    fn next_seed(&self) -> u8 {
        self.seed.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    fn take_acceptor(&self, b32: &str) -> Option<TcpStream> {
        self.acceptors
            .lock()
            .ok()?
            .get_mut(b32)
            .and_then(VecDeque::pop_front)
    }
}

/// Fake SAM bridge listening on loopback
pub struct FakeSamBridge {
    addr: SocketAddr,
    datagram_addr: SocketAddr,
    state: Arc<FakeState>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeSamBridge {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let udp = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let datagram_addr = udp.local_addr()?;

        let state = Arc::new(FakeState::default());
        if let Ok(mut reply) = state.hello_reply.lock() {
            *reply = "HELLO REPLY RESULT=OK VERSION=3.1".to_string();
        }
        if let Ok(mut wait) = state.connect_wait.lock() {
            *wait = Duration::from_secs(2);
        }

        let accept_state = state.clone();
        let tcp_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(handle_connection(socket, accept_state.clone()));
            }
        });

        let udp_state = state.clone();
        let udp_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            while let Ok((n, _)) = udp.recv_from(&mut buf).await {
                if let Ok(mut datagrams) = udp_state.datagrams.lock() {
                    datagrams.push(buf[..n].to_vec());
                }
            }
        });

        Ok(FakeSamBridge {
            addr,
            datagram_addr,
            state,
            tasks: vec![tcp_task, udp_task],
        })
    }

    /// Client configuration pointing at this bridge
    pub fn sam_config(&self) -> SamConfig {
        SamConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            datagram_port: self.datagram_addr.port(),
            reply_timeout_secs: 5,
            ..SamConfig::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Line sent in answer to HELLO
    pub fn set_hello_reply(&self, reply: &str) {
        if let Ok(mut current) = self.state.hello_reply.lock() {
            *current = reply.to_string();
        }
    }

    /// How long STREAM CONNECT waits for a parked acceptor
    pub fn set_connect_wait(&self, wait: Duration) {
        if let Ok(mut current) = self.state.connect_wait.lock() {
            *current = wait;
        }
    }

    /// Every command line received, in order
    pub fn commands(&self) -> Vec<String> {
        self.state
            .commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn datagrams(&self) -> Vec<Vec<u8>> {
        self.state
            .datagrams
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Drop for FakeSamBridge {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn handle_connection(socket: TcpStream, state: Arc<FakeState>) {
    let mut reader = BufReader::new(socket);
    let mut owned_sessions = Vec::new();
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let command = line.trim_end().to_string();
        if let Ok(mut commands) = state.commands.lock() {
            commands.push(command.clone());
        }

        let Ok(request) = SamReply::parse(&command) else {
            let _ = write(&mut reader, "ERROR RESULT=I2P_ERROR").await;
            break;
        };
        let topic: Vec<&str> = request.topic().iter().map(String::as_str).collect();

        match topic.as_slice() {
            ["HELLO", "VERSION", ..] => {
                let reply = state
                    .hello_reply
                    .lock()
                    .map(|r| r.clone())
                    .unwrap_or_default();
                let ok = reply.contains("RESULT=OK");
                if write(&mut reader, &reply).await.is_err() || !ok {
                    break;
                }
            }
            ["SESSION", "CREATE", ..] => {
                let reply = create_session(&state, &request, &mut owned_sessions);
                if write(&mut reader, &reply).await.is_err() {
                    break;
                }
            }
            ["DEST", "GENERATE", ..] => {
                let seed = state.next_seed();
                let reply = format!(
                    "DEST REPLY PUB={} PRIV={}",
                    fake_destination(seed, 0),
                    fake_destination(seed, 64)
                );
                if write(&mut reader, &reply).await.is_err() {
                    break;
                }
            }
            ["NAMING", "LOOKUP", ..] => {
                let name = request.get("NAME").unwrap_or_default().to_string();
                let found = state.sessions.lock().ok().and_then(|sessions| {
                    sessions
                        .values()
                        .find(|dest| b32_address(dest).ok().as_deref() == Some(name.as_str()))
                        .cloned()
                });
                let reply = match found {
                    Some(dest) => format!("NAMING REPLY RESULT=OK NAME={} VALUE={}", name, dest),
                    None => format!("NAMING REPLY RESULT=KEY_NOT_FOUND NAME={}", name),
                };
                if write(&mut reader, &reply).await.is_err() {
                    break;
                }
            }
            ["STREAM", "ACCEPT", ..] => {
                let Some(dest) = session_destination(&state, &request) else {
                    let _ = write(&mut reader, "STREAM STATUS RESULT=INVALID_ID").await;
                    break;
                };
                if write(&mut reader, "STREAM STATUS RESULT=OK").await.is_err() {
                    break;
                }
                if let (Ok(b32), Ok(mut acceptors)) = (b32_address(&dest), state.acceptors.lock()) {
                    acceptors
                        .entry(b32)
                        .or_default()
                        .push_back(reader.into_inner());
                }
                return;
            }
            ["STREAM", "CONNECT", ..] => {
                let Some(own_dest) = session_destination(&state, &request) else {
                    let _ = write(&mut reader, "STREAM STATUS RESULT=INVALID_ID").await;
                    break;
                };
                let target = request.get("DESTINATION").unwrap_or_default().to_string();
                let target_b32 = if target.ends_with(".b32.i2p") {
                    target
                } else {
                    b32_address(&target).unwrap_or_default()
                };

                match wait_for_acceptor(&state, &target_b32).await {
                    Some(mut acceptor) => {
                        let header = format!("{} FROM_PORT=0 TO_PORT=0\n", own_dest);
                        if acceptor.write_all(header.as_bytes()).await.is_err() {
                            let _ = write(&mut reader, "STREAM STATUS RESULT=CANT_REACH_PEER")
                                .await;
                            break;
                        }
                        if write(&mut reader, "STREAM STATUS RESULT=OK").await.is_err() {
                            break;
                        }
                        let mut connector = reader.into_inner();
                        let _ = tokio::io::copy_bidirectional(&mut connector, &mut acceptor).await;
                        return;
                    }
                    None => {
                        let _ = write(
                            &mut reader,
                            "STREAM STATUS RESULT=CANT_REACH_PEER MESSAGE=\"no route\"",
                        )
                        .await;
                        break;
                    }
                }
            }
            _ => {
                let _ = write(&mut reader, "ERROR RESULT=I2P_ERROR MESSAGE=\"unsupported\"").await;
            }
        }
    }

    // Sessions die with their control socket
    if let Ok(mut sessions) = state.sessions.lock() {
        for id in owned_sessions {
            sessions.remove(&id);
        }
    }
}

fn create_session(state: &FakeState, request: &SamReply, owned: &mut Vec<String>) -> String {
    let Some(id) = request.get("ID") else {
        return "SESSION STATUS RESULT=I2P_ERROR MESSAGE=\"missing ID\"".to_string();
    };
    let requested = request.get("DESTINATION").unwrap_or("TRANSIENT");

    let private = if requested == "TRANSIENT" {
        fake_destination(state.next_seed(), 64)
    } else {
        requested.to_string()
    };
    let Ok(public) = public_destination(&private) else {
        return "SESSION STATUS RESULT=INVALID_KEY".to_string();
    };

    let Ok(mut sessions) = state.sessions.lock() else {
        return "SESSION STATUS RESULT=I2P_ERROR".to_string();
    };
    if sessions.contains_key(id) {
        return "SESSION STATUS RESULT=DUPLICATED_ID".to_string();
    }
    if sessions.values().any(|d| *d == public) {
        return "SESSION STATUS RESULT=DUPLICATED_DEST".to_string();
    }
    sessions.insert(id.to_string(), public);
    owned.push(id.to_string());

    format!("SESSION STATUS RESULT=OK DESTINATION={}", private)
}

fn session_destination(state: &FakeState, request: &SamReply) -> Option<String> {
    let id = request.get("ID")?;
    state.sessions.lock().ok()?.get(id).cloned()
}

async fn wait_for_acceptor(state: &FakeState, b32: &str) -> Option<TcpStream> {
    let wait = state
        .connect_wait
        .lock()
        .map(|w| *w)
        .unwrap_or_default();
    let deadline = tokio::time::Instant::now() + wait;

    loop {
        if let Some(acceptor) = state.take_acceptor(b32) {
            return Some(acceptor);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn write(reader: &mut BufReader<TcpStream>, line: &str) -> std::io::Result<()> {
    let socket = reader.get_mut();
    socket.write_all(line.as_bytes()).await?;
    socket.write_all(b"\n").await?;
    socket.flush().await
}
