use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::remote::{ErrCode, Request, Response, read_frame, write_frame};

/// Memory node settings.
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    /// Bind address; use port 0 to let the OS pick (handy in tests).
    pub listen_addr: String,
    /// Total bytes of region data this node will hold.
    pub capacity_bytes: u64,
    /// Identifier returned in handshakes.
    pub node_id: u64,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        KeeperConfig {
            listen_addr: "127.0.0.1:0".into(),
            capacity_bytes: 1 << 30,
            node_id: 100,
        }
    }
}

struct Region {
    buf: Vec<u8>,
    /// Set at finalize; reads are only served through it.
    token: Option<u64>,
}

struct KeeperState {
    regions: HashMap<String, Region>,
    /// token -> region name.
    tokens: HashMap<u64, String>,
    used_bytes: u64,
    next_token: u64,
}

/// The memory node: holds finalized regions in RAM and serves byte
/// ranges to any compute node presenting a valid capability token.
///
/// The keeper never interprets region contents. It enforces exactly two
/// rules: writes only touch unfinalized regions, and reads only go
/// through tokens, which exist only for finalized regions.
pub struct MemoryNodeKeeper {
    config: KeeperConfig,
}

impl MemoryNodeKeeper {
    pub fn new(config: KeeperConfig) -> Self {
        MemoryNodeKeeper { config }
    }

    /// Bind and start serving on a background thread. The returned
    /// handle stops the node when dropped.
    pub fn serve(self) -> Result<KeeperHandle> {
        let listener = TcpListener::bind(&self.config.listen_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(KeeperState {
            regions: HashMap::new(),
            tokens: HashMap::new(),
            used_bytes: 0,
            next_token: 1,
        }));

        let accept_shutdown = Arc::clone(&shutdown);
        let config = self.config.clone();
        let accept_thread = std::thread::Builder::new()
            .name("keeper-accept".into())
            .spawn(move || accept_loop(listener, config, state, accept_shutdown))
            .map_err(Error::Io)?;

        log::info!("memory node {} listening on {addr}", self.config.node_id);
        Ok(KeeperHandle {
            addr,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }
}

/// Running memory node. Dropping it shuts the node down and joins its
/// threads.
pub struct KeeperHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl KeeperHandle {
    /// Address compute nodes should dial.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for KeeperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    config: KeeperConfig,
    state: Arc<Mutex<KeeperState>>,
    shutdown: Arc<AtomicBool>,
) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("memory node accepted {peer}");
                let state = Arc::clone(&state);
                let shutdown = Arc::clone(&shutdown);
                let config = config.clone();
                let spawn = std::thread::Builder::new()
                    .name("keeper-conn".into())
                    .spawn(move || serve_connection(stream, config, state, shutdown));
                match spawn {
                    Ok(handle) => connections.push(handle),
                    Err(e) => log::error!("cannot spawn connection thread: {e}"),
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                log::error!("accept failed: {e}");
                break;
            }
        }
    }
    for handle in connections {
        let _ = handle.join();
    }
}

fn serve_connection(
    stream: TcpStream,
    config: KeeperConfig,
    state: Arc<Mutex<KeeperState>>,
    shutdown: Arc<AtomicBool>,
) {
    // Between frames the socket is polled with a short timeout so the
    // thread notices shutdown promptly. Once a frame has started, reads
    // get a generous per-call timeout instead: restarting read_frame
    // after a mid-frame timeout would discard the bytes already consumed
    // and desync the stream for a slow peer.
    const IDLE_POLL: Duration = Duration::from_millis(100);
    const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(5);

    let mut stream = stream;
    if stream.set_nodelay(true).is_err() {
        return;
    }
    if stream.set_read_timeout(Some(IDLE_POLL)).is_err() {
        return;
    }

    while !shutdown.load(Ordering::SeqCst) {
        let mut peeked = [0u8; 1];
        match stream.peek(&mut peeked) {
            Ok(0) => return, // peer closed
            Ok(_) => {}
            Err(ref e)
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => return,
        }
        if stream.set_read_timeout(Some(FRAME_READ_TIMEOUT)).is_err() {
            return;
        }
        let body = match read_frame(&mut stream) {
            Ok(body) => body,
            // Peer hung up, stalled mid-frame, or sent garbage; either
            // way this link is done.
            Err(_) => return,
        };
        if stream.set_read_timeout(Some(IDLE_POLL)).is_err() {
            return;
        }
        let response = match Request::decode(&body) {
            Ok(request) => handle_request(request, &config, &state),
            Err(e) => Response::Err {
                code: ErrCode::InvalidArgument,
                message: format!("undecodable request: {e}"),
            },
        };
        if write_frame(&mut stream, &response.encode()).is_err() {
            return;
        }
    }
}

fn handle_request(
    request: Request,
    config: &KeeperConfig,
    state: &Mutex<KeeperState>,
) -> Response {
    let mut state = state.lock();
    match request {
        Request::Handshake { node_id } => {
            log::debug!("handshake from compute node {node_id}");
            Response::Handshake {
                node_id: config.node_id,
            }
        }
        Request::Alloc { name } => {
            if name.is_empty() {
                return err(ErrCode::InvalidArgument, "empty region name");
            }
            if state.regions.contains_key(&name) {
                return err(ErrCode::InvalidArgument, format!("region {name} exists"));
            }
            state.regions.insert(
                name,
                Region {
                    buf: Vec::new(),
                    token: None,
                },
            );
            Response::Ok
        }
        Request::Write { name, bytes } => {
            if state.used_bytes + bytes.len() as u64 > config.capacity_bytes {
                return err(ErrCode::Capacity, "memory node capacity exhausted");
            }
            let Some(region) = state.regions.get_mut(&name) else {
                return err(ErrCode::NotFound, format!("no region {name}"));
            };
            if region.token.is_some() {
                return err(
                    ErrCode::InvalidArgument,
                    format!("region {name} is finalized"),
                );
            }
            region.buf.extend_from_slice(&bytes);
            state.used_bytes += bytes.len() as u64;
            Response::Ok
        }
        Request::Finalize { name } => {
            let token = state.next_token;
            let Some(region) = state.regions.get_mut(&name) else {
                return err(ErrCode::NotFound, format!("no region {name}"));
            };
            // Finalize twice returns the same token.
            if let Some(existing) = region.token {
                return Response::Token {
                    token: existing,
                    len: region.buf.len() as u64,
                };
            }
            region.token = Some(token);
            let len = region.buf.len() as u64;
            state.next_token += 1;
            state.tokens.insert(token, name);
            Response::Token { token, len }
        }
        Request::ReadAt { token, offset, len } => {
            let Some(name) = state.tokens.get(&token) else {
                return err(ErrCode::NotFound, format!("no capability {token}"));
            };
            let Some(region) = state.regions.get(name) else {
                return err(ErrCode::NotFound, format!("stale capability {token}"));
            };
            let end = offset.saturating_add(len as u64);
            if end > region.buf.len() as u64 {
                return err(
                    ErrCode::InvalidArgument,
                    format!("read {offset}+{len} past region end {}", region.buf.len()),
                );
            }
            Response::Bytes(region.buf[offset as usize..end as usize].to_vec())
        }
        Request::Delete { name } => {
            if let Some(region) = state.regions.remove(&name) {
                state.used_bytes -= region.buf.len() as u64;
                if let Some(token) = region.token {
                    state.tokens.remove(&token);
                }
            }
            Response::Ok
        }
        Request::Token { name } => {
            let Some(region) = state.regions.get(&name) else {
                return err(ErrCode::NotFound, format!("no region {name}"));
            };
            match region.token {
                Some(token) => Response::Token {
                    token,
                    len: region.buf.len() as u64,
                },
                None => err(ErrCode::NotFound, format!("region {name} not finalized")),
            }
        }
        Request::List => {
            let mut names: Vec<String> = state.regions.keys().cloned().collect();
            names.sort();
            Response::Names(names)
        }
    }
}

fn err(code: ErrCode, message: impl Into<String>) -> Response {
    Response::Err {
        code,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Connection, ConnectionConfig};

    fn start_keeper() -> KeeperHandle {
        MemoryNodeKeeper::new(KeeperConfig::default()).serve().unwrap()
    }

    fn connect(handle: &KeeperHandle) -> Connection {
        Connection::connect(ConnectionConfig::new(handle.addr().to_string())).unwrap()
    }

    #[test]
    fn alloc_write_finalize_read() {
        let keeper = start_keeper();
        let conn = connect(&keeper);

        conn.call(Request::Alloc { name: "r1".into() }).unwrap();
        conn.call(Request::Write {
            name: "r1".into(),
            bytes: b"hello world".to_vec(),
        })
        .unwrap();
        let Response::Token { token, len } =
            conn.call(Request::Finalize { name: "r1".into() }).unwrap()
        else {
            panic!("expected token");
        };
        assert_eq!(len, 11);

        let Response::Bytes(bytes) = conn
            .call(Request::ReadAt {
                token,
                offset: 6,
                len: 5,
            })
            .unwrap()
        else {
            panic!("expected bytes");
        };
        assert_eq!(bytes, b"world");
    }

    #[test]
    fn reads_require_finalize() {
        let keeper = start_keeper();
        let conn = connect(&keeper);

        conn.call(Request::Alloc { name: "r1".into() }).unwrap();
        conn.call(Request::Write {
            name: "r1".into(),
            bytes: vec![1, 2, 3],
        })
        .unwrap();
        // No token exists yet, so no read path to the bytes.
        assert!(matches!(
            conn.call(Request::Token { name: "r1".into() }),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn write_after_finalize_rejected() {
        let keeper = start_keeper();
        let conn = connect(&keeper);

        conn.call(Request::Alloc { name: "r1".into() }).unwrap();
        conn.call(Request::Finalize { name: "r1".into() }).unwrap();
        assert!(matches!(
            conn.call(Request::Write {
                name: "r1".into(),
                bytes: vec![0],
            }),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn delete_is_idempotent_and_revokes_token() {
        let keeper = start_keeper();
        let conn = connect(&keeper);

        conn.call(Request::Alloc { name: "r1".into() }).unwrap();
        let Response::Token { token, .. } =
            conn.call(Request::Finalize { name: "r1".into() }).unwrap()
        else {
            panic!("expected token");
        };
        conn.call(Request::Delete { name: "r1".into() }).unwrap();
        conn.call(Request::Delete { name: "r1".into() }).unwrap();
        assert!(matches!(
            conn.call(Request::ReadAt {
                token,
                offset: 0,
                len: 1,
            }),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn capacity_is_enforced() {
        let keeper = MemoryNodeKeeper::new(KeeperConfig {
            capacity_bytes: 8,
            ..KeeperConfig::default()
        })
        .serve()
        .unwrap();
        let conn = connect(&keeper);

        conn.call(Request::Alloc { name: "r1".into() }).unwrap();
        assert!(matches!(
            conn.call(Request::Write {
                name: "r1".into(),
                bytes: vec![0; 64],
            }),
            Err(Error::RemoteUnavailable(_))
        ));
    }

    #[test]
    fn list_names_sorted() {
        let keeper = start_keeper();
        let conn = connect(&keeper);
        for name in ["b.sst", "a.sst"] {
            conn.call(Request::Alloc { name: name.into() }).unwrap();
        }
        let Response::Names(names) = conn.call(Request::List).unwrap() else {
            panic!("expected names");
        };
        assert_eq!(names, vec!["a.sst", "b.sst"]);
    }

    #[test]
    fn slow_frames_survive_idle_polling() {
        let keeper = start_keeper();
        let mut stream = TcpStream::connect(keeper.addr()).unwrap();
        stream.set_nodelay(true).unwrap();

        let body = Request::List.encode();
        let mut frame = Vec::new();
        frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);

        // Drip the frame across multiple idle-poll intervals; the bytes
        // already received must not be thrown away in between.
        use std::io::Write;
        stream.write_all(&frame[..5]).unwrap();
        stream.flush().unwrap();
        std::thread::sleep(Duration::from_millis(350));
        stream.write_all(&frame[5..]).unwrap();

        let reply = read_frame(&mut stream).unwrap();
        assert!(matches!(
            Response::decode(&reply).unwrap(),
            Response::Names(_)
        ));
    }

    #[test]
    fn keeper_loss_surfaces_as_remote_unavailable() {
        let keeper = start_keeper();
        let conn = connect(&keeper);
        conn.call(Request::Alloc { name: "r1".into() }).unwrap();
        drop(keeper);
        // Give the sockets a moment to close.
        std::thread::sleep(Duration::from_millis(300));
        assert!(matches!(
            conn.call(Request::List),
            Err(Error::RemoteUnavailable(_)) | Err(Error::Io(_)) | Err(Error::Corruption(_))
        ));
    }
}
