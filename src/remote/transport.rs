use std::net::TcpStream;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::error::{Error, Result};
use crate::remote::{Request, Response, read_frame, write_frame};

/// Client-side tuning for one memory-node link.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Memory node address, e.g. "127.0.0.1:7000".
    pub addr: String,
    /// Identifier this compute node presents in the handshake.
    pub node_id: u64,
    /// Per-operation socket timeout.
    pub op_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        ConnectionConfig {
            addr: addr.into(),
            node_id: 1,
            op_timeout: Duration::from_secs(5),
        }
    }
}

enum Command {
    Call {
        request: Request,
        reply: Sender<Result<Response>>,
    },
}

/// A link to one memory node.
///
/// A single poller thread owns the socket; callers hand it requests over
/// a channel and block on a per-call completion channel. Serializing all
/// traffic through one owner keeps request/response pairing trivial and
/// means a broken socket is observed in exactly one place. The poller
/// drops a dead socket and redials on the next call, so a memory node
/// restart heals without rebuilding the [`Connection`].
pub struct Connection {
    tx: Option<Sender<Command>>,
    poller: Option<JoinHandle<()>>,
}

impl Connection {
    /// Dial the memory node and verify the handshake. Fails fast if the
    /// node is unreachable, so misconfiguration surfaces at open time.
    pub fn connect(config: ConnectionConfig) -> Result<Self> {
        let mut stream = Some(dial(&config)?);
        let (tx, rx) = crossbeam_channel::unbounded::<Command>();
        let poller = std::thread::Builder::new()
            .name("remote-poller".into())
            .spawn(move || poller_loop(config, &mut stream, rx))
            .map_err(Error::Io)?;
        Ok(Connection {
            tx: Some(tx),
            poller: Some(poller),
        })
    }

    /// Issue one request and wait for its response. Transport failures
    /// come back as [`Error::RemoteUnavailable`]; protocol-level errors
    /// are mapped by [`Response::into_result`].
    pub fn call(&self, request: Request) -> Result<Response> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::RemoteUnavailable("connection is shut down".into()))?;
        tx.send(Command::Call {
            request,
            reply: reply_tx,
        })
        .map_err(|_| Error::RemoteUnavailable("connection is shut down".into()))?;
        match reply_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::RemoteUnavailable(
                "connection poller exited".into(),
            )),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Closing the channel stops the poller.
        self.tx.take();
        if let Some(handle) = self.poller.take() {
            let _ = handle.join();
        }
    }
}

fn dial(config: &ConnectionConfig) -> Result<TcpStream> {
    let stream = TcpStream::connect(&config.addr).map_err(|e| {
        Error::RemoteUnavailable(format!("cannot reach memory node {}: {e}", config.addr))
    })?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(config.op_timeout))?;
    stream.set_write_timeout(Some(config.op_timeout))?;

    let mut stream = stream;
    write_frame(
        &mut stream,
        &Request::Handshake {
            node_id: config.node_id,
        }
        .encode(),
    )?;
    let body = read_frame(&mut stream)?;
    match Response::decode(&body)?.into_result()? {
        Response::Handshake { node_id } => {
            log::info!(
                "connected to memory node {} (id {node_id})",
                config.addr
            );
            Ok(stream)
        }
        other => Err(Error::Corruption(format!(
            "unexpected handshake response: {other:?}"
        ))),
    }
}

fn poller_loop(
    config: ConnectionConfig,
    stream: &mut Option<TcpStream>,
    rx: Receiver<Command>,
) {
    while let Ok(Command::Call { request, reply }) = rx.recv() {
        let result = exchange(&config, stream, &request);
        // Caller may have given up; a dropped receiver is fine.
        let _ = reply.send(result);
    }
}

fn exchange(
    config: &ConnectionConfig,
    stream: &mut Option<TcpStream>,
    request: &Request,
) -> Result<Response> {
    if stream.is_none() {
        match dial(config) {
            Ok(s) => *stream = Some(s),
            Err(e) => return Err(e),
        }
    }
    let socket = stream.as_mut().ok_or_else(|| {
        Error::RemoteUnavailable("no connection to memory node".into())
    })?;

    let outcome = (|| -> Result<Response> {
        write_frame(socket, &request.encode())?;
        let body = read_frame(socket)?;
        Response::decode(&body)
    })();

    match outcome {
        Ok(response) => response.into_result(),
        Err(Error::Io(e)) => {
            // Socket is in an unknown state; drop it and redial next call.
            *stream = None;
            log::warn!("memory node {} link failed: {e}", config.addr);
            Err(Error::RemoteUnavailable(format!(
                "lost memory node {}: {e}",
                config.addr
            )))
        }
        Err(e) => {
            *stream = None;
            Err(e)
        }
    }
}
