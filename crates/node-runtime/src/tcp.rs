//! TCP adapters for the two peer ports.
//!
//! Frames are `u32` little-endian length followed by canonical bincode.
//! Clients hold one lazily opened connection per peer and surface every
//! failure as a retryable `TransportError`; the send/fetch workers own the
//! retry policy. Servers run an accept loop plus one thread per connection;
//! shutdown is flag-and-timeout based.

use kestrel_consensus_types::ReplicaInfo;
use kestrel_network::{
    BlockFetchRequest, BlockFetchResponse, FetchClient, FetchService, PeerConnector, PeerMessage,
    ProtocolClient, ProtocolService, TransportError,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared_types::JoinOnDrop;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on a single frame; anything larger is a protocol violation.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const IO_TIMEOUT: Duration = Duration::from_secs(10);
/// Read timeout used by server connection threads so they can observe the
/// shutdown flag.
const SERVER_POLL_TIMEOUT: Duration = Duration::from_millis(500);

fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<(), TransportError> {
    let payload = bincode::serialize(value).map_err(|e| TransportError::Send(e.to_string()))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    stream
        .write_all(&frame)
        .map_err(|e| TransportError::Send(e.to_string()))
}

fn read_frame<T: DeserializeOwned>(stream: &mut TcpStream) -> Result<T, TransportError> {
    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .map_err(|e| TransportError::Recv(e.to_string()))?;
    read_frame_body(stream, len_bytes)
}

/// Server-side read: a timeout while waiting for the next frame is a normal
/// idle poll (`Ok(None)`), not a connection error.
fn read_frame_poll<T: DeserializeOwned>(
    stream: &mut TcpStream,
) -> Result<Option<T>, TransportError> {
    let mut len_bytes = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut len_bytes) {
        return match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Ok(None),
            _ => Err(TransportError::Recv(e.to_string())),
        };
    }
    read_frame_body(stream, len_bytes).map(Some)
}

fn read_frame_body<T: DeserializeOwned>(
    stream: &mut TcpStream,
    len_bytes: [u8; 4],
) -> Result<T, TransportError> {
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::Recv(format!("oversized frame: {len} bytes")));
    }
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .map_err(|e| TransportError::Recv(e.to_string()))?;
    bincode::deserialize(&payload).map_err(|e| TransportError::Recv(e.to_string()))
}

fn connect(addr: &str) -> Result<TcpStream, TransportError> {
    let sockaddr = addr
        .parse()
        .map_err(|e| TransportError::Connect(addr.to_string(), format!("bad address: {e}")))?;
    let stream = TcpStream::connect_timeout(&sockaddr, CONNECT_TIMEOUT)
        .map_err(|e| TransportError::Connect(addr.to_string(), e.to_string()))?;
    stream
        .set_read_timeout(Some(IO_TIMEOUT))
        .and_then(|()| stream.set_write_timeout(Some(IO_TIMEOUT)))
        .and_then(|()| stream.set_nodelay(true))
        .map_err(|e| TransportError::Connect(addr.to_string(), e.to_string()))?;
    Ok(stream)
}

/// Persistent best-effort connection shared by the two client kinds.
struct PeerConnection {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
}

impl PeerConnection {
    fn new(addr: String) -> Self {
        Self {
            addr,
            stream: Mutex::new(None),
        }
    }

    /// Run `op` on the (re)established connection; drop the connection on
    /// any failure so the next call reconnects.
    fn with_stream<R>(
        &self,
        op: impl FnOnce(&mut TcpStream) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let mut guard = self.stream.lock();
        if guard.is_none() {
            *guard = Some(connect(&self.addr)?);
        }
        let stream = match guard.as_mut() {
            Some(stream) => stream,
            None => return Err(TransportError::Unavailable),
        };
        match op(stream) {
            Ok(out) => Ok(out),
            Err(err) => {
                *guard = None;
                Err(err)
            }
        }
    }
}

pub struct TcpProtocolClient {
    conn: PeerConnection,
}

impl ProtocolClient for TcpProtocolClient {
    fn send(&self, msg: &PeerMessage) -> Result<(), TransportError> {
        self.conn.with_stream(|stream| write_frame(stream, msg))
    }
}

pub struct TcpFetchClient {
    conn: PeerConnection,
}

impl FetchClient for TcpFetchClient {
    fn fetch(&self, req: &BlockFetchRequest) -> Result<BlockFetchResponse, TransportError> {
        self.conn.with_stream(|stream| {
            write_frame(stream, req)?;
            read_frame(stream)
        })
    }
}

/// Hands out TCP clients keyed by the replica addresses in the config.
pub struct TcpConnector;

impl PeerConnector for TcpConnector {
    fn protocol_client(&self, info: &ReplicaInfo) -> Arc<dyn ProtocolClient> {
        Arc::new(TcpProtocolClient {
            conn: PeerConnection::new(info.protocol_addr()),
        })
    }

    fn fetch_client(&self, info: &ReplicaInfo) -> Arc<dyn FetchClient> {
        Arc::new(TcpFetchClient {
            conn: PeerConnection::new(info.fetch_addr()),
        })
    }
}

/// A listening port with its accept loop and connection threads.
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    local_addr: std::net::SocketAddr,
    _accept_loop: JoinOnDrop,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// The actually bound address (useful with port 0).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_server<F>(name: &str, addr: &str, on_connection: F) -> anyhow::Result<ServerHandle>
where
    F: Fn(TcpStream, &AtomicBool) + Send + Sync + 'static,
{
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "{name} listening");

    let shutdown = Arc::new(AtomicBool::new(false));
    let loop_shutdown = Arc::clone(&shutdown);
    let name = name.to_string();
    let on_connection = Arc::new(on_connection);

    let accept_loop = JoinOnDrop::spawn(&format!("{name}-accept"), move || {
        let mut conn_threads = Vec::new();
        while !loop_shutdown.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    debug!(%peer_addr, "{name} accepted connection");
                    if stream.set_read_timeout(Some(SERVER_POLL_TIMEOUT)).is_err() {
                        continue;
                    }
                    let conn_shutdown = Arc::clone(&loop_shutdown);
                    let handler = Arc::clone(&on_connection);
                    conn_threads.push(JoinOnDrop::spawn(&format!("{name}-conn"), move || {
                        (*handler)(stream, &conn_shutdown)
                    }));
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(err) => {
                    warn!(%err, "{name} accept failed");
                    std::thread::sleep(Duration::from_millis(200));
                }
            }
        }
        // joining conn_threads here; they exit via the shared flag
    });

    Ok(ServerHandle {
        shutdown,
        local_addr,
        _accept_loop: accept_loop,
    })
}

/// Serve the one-way vote/proposal port.
pub fn spawn_protocol_server(
    addr: &str,
    service: Arc<ProtocolService>,
) -> anyhow::Result<ServerHandle> {
    spawn_server("protocol-server", addr, move |mut stream, shutdown| {
        while !shutdown.load(Ordering::Acquire) {
            match read_frame_poll::<PeerMessage>(&mut stream) {
                Ok(Some(msg)) => service.handle(msg),
                Ok(None) => continue,
                Err(err) => {
                    debug!(%err, "protocol connection closed");
                    return;
                }
            }
        }
    })
}

/// Serve the request/response block-fetch port.
pub fn spawn_fetch_server(addr: &str, service: Arc<FetchService>) -> anyhow::Result<ServerHandle> {
    spawn_server("fetch-server", addr, move |mut stream, shutdown| {
        while !shutdown.load(Ordering::Acquire) {
            match read_frame_poll::<BlockFetchRequest>(&mut stream) {
                Ok(Some(req)) => {
                    let response = service.fetch(&req);
                    if let Err(err) = write_frame(&mut stream, &response) {
                        debug!(%err, "fetch response failed");
                        return;
                    }
                }
                Ok(None) => continue,
                Err(err) => {
                    debug!(%err, "fetch connection closed");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_block_store::{Block, BlockArchive, BlockStore};
    use kestrel_network::NetworkEventQueue;
    use kestrel_consensus_types::{QuorumCertificate, ReplicaConfig};
    use shared_crypto::Ed25519KeyPair;
    use shared_types::ZERO_HASH;

    fn test_replica(id: u32, protocol_port: u16, fetch_port: u16) -> ReplicaInfo {
        ReplicaInfo {
            id,
            hostname: "127.0.0.1".into(),
            protocol_port,
            fetch_port,
            public_key: Ed25519KeyPair::from_seed([id as u8 + 1; 32]).public_key(),
        }
    }

    #[test]
    fn test_fetch_roundtrip_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(BlockArchive::open(dir.path()).unwrap());
        let genesis = Block::genesis();
        let store = Arc::new(BlockStore::new(genesis, archive));

        let block = Block::mint(b"b1".to_vec(), QuorumCertificate::genesis(), ZERO_HASH).unwrap();
        store.insert(Arc::clone(&block)).unwrap();

        let service = Arc::new(FetchService::new(store));
        let server = spawn_fetch_server("127.0.0.1:0", service).unwrap();
        let port = server.local_addr().port();

        let info = test_replica(1, 0, port);
        let client = TcpConnector.fetch_client(&info);

        // the server may need a moment to start accepting
        let mut response = None;
        for _ in 0..50 {
            match client.fetch(&BlockFetchRequest {
                reqs: vec![*block.hash()],
            }) {
                Ok(r) => {
                    response = Some(r);
                    break;
                }
                Err(_) => std::thread::sleep(Duration::from_millis(50)),
            }
        }
        let response = response.expect("fetch over tcp");
        assert_eq!(response.responses.len(), 1);
        assert_eq!(&response.responses[0].hash().unwrap(), block.hash());

        server.shutdown();
    }

    #[test]
    fn test_protocol_send_reaches_pipeline() {
        let config = Arc::new(
            ReplicaConfig::new(vec![test_replica(0, 0, 0), test_replica(1, 0, 0)]).unwrap(),
        );
        let pipeline = NetworkEventQueue::new(config);
        let service = Arc::new(ProtocolService::new(pipeline));

        let server = spawn_protocol_server("127.0.0.1:0", service).unwrap();
        let port = server.local_addr().port();

        let info = test_replica(1, port, 0);
        let client = TcpConnector.protocol_client(&info);

        let keypair = Ed25519KeyPair::from_seed([2u8; 32]);
        let msg = PeerMessage::Vote(kestrel_network::VoteMessage {
            vote: kestrel_consensus_types::PartialCertificate::create([5u8; 32], &keypair),
            voter: 1,
        });

        let mut sent = false;
        for _ in 0..50 {
            if client.send(&msg).is_ok() {
                sent = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(sent, "vote over tcp");

        server.shutdown();
    }
}
