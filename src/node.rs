use std::{
    collections::{BTreeSet, HashMap},
    fmt::Display,
    net::{IpAddr, TcpListener},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock, Weak,
    },
    thread::{self, JoinHandle},
    time::SystemTime,
};

use anyhow::Context;

use crate::{
    error::SwarmError,
    message::{
        BitfieldMessage, HandshakeMessage, HaveMessage, Message, PeerInfo, PeersMessage,
        PieceMessage, RequestMessage,
    },
    storage::FileStore,
    swarmerr,
    util::{generate_id, timestr},
};

pub mod connection;
pub mod listener;
pub mod monitor;

use connection::{ConnectionHandle, Direction};

/// default piece size (bytes); collapses to the file size for smaller files
pub const DEFAULT_PIECE_SIZE: u64 = 65536;

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub file: PathBuf,
    pub peer: Option<(String, u16)>,
    pub verbose: bool,
}

/// Identity and layout of the shared file, fixed for the life of the node
/// once known. Seeds derive it from disk at startup; leechers adopt it from
/// the first peer whose handshake carries the full set.
#[derive(Clone, Debug)]
pub struct Metadata {
    pub file_name: String,
    pub file_size: u64,
    pub piece_size: u64,
    pub file_hash: String,
}

impl Metadata {
    fn from_handshake(handshake: &HandshakeMessage) -> Option<Self> {
        Some(Self {
            file_name: handshake.file_name.clone()?,
            file_size: handshake.file_size?,
            piece_size: handshake.piece_size?,
            file_hash: handshake.file_hash.clone()?,
        })
    }

    pub fn num_pieces(&self) -> usize {
        if self.piece_size == 0 {
            0
        } else {
            ((self.file_size + self.piece_size - 1) / self.piece_size) as usize
        }
    }
}

/// Record of a known peer, keyed in `Node::peers` by its id so that a
/// reconnect updates the record instead of duplicating it. The record
/// outlives its connection and is re-bound on reconnect.
pub struct Peer {
    pub host: String,
    pub port: u16,
    pub connection: Option<ConnectionHandle>,
    pub available: BTreeSet<usize>,
    pub busy: bool,
    pub handshake_sent: bool,
    pub handshake_received: bool,
}

impl Peer {
    fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            connection: None,
            available: BTreeSet::new(),
            busy: false,
            handshake_sent: false,
            handshake_received: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

/// Verdict returned to the connection driver after dispatching one message.
pub enum Verdict {
    Continue,
    /// Bind the connection to this peer id for subsequent messages.
    Register(String),
    /// Shut the connection down.
    Close,
}

/// For any unordered pair of distinct ids exactly one side dials, which
/// breaks the simultaneous-connect race after a peer exchange.
pub fn should_initiate(self_id: &str, other_id: &str) -> bool {
    self_id > other_id
}

/// All node state. Listener, monitor, and connection threads share one
/// `Arc<RwLock<Node>>`; every mutation of the piece sets and the peer map
/// happens under the write lock.
pub struct Node {
    pub id: String,
    pub port: u16,
    pub metadata: Option<Metadata>,
    pub store: FileStore,
    pub have: BTreeSet<usize>,
    pub missing: BTreeSet<usize>,
    pub pending: BTreeSet<usize>,
    pub peers: HashMap<String, Peer>,
    pub bytes_downloaded: u64,
    pub start_time: Option<SystemTime>,
    pub is_seed: bool,
    pub verbose: bool,
    pub shutdown: Arc<AtomicBool>,
    board: Weak<RwLock<Node>>,
    next_connection_id: u64,
}

impl Node {
    fn log(&self, message: impl Display) {
        if self.verbose {
            println!("[{}][{}] {}", timestr(), self.id, message);
        }
    }

    pub fn next_connection_id(&mut self) -> u64 {
        self.next_connection_id += 1;
        self.next_connection_id
    }

    /// Handshake advertising whatever metadata is currently known.
    pub fn handshake_message(&self) -> Message {
        let metadata = self.metadata.as_ref();
        Message::Handshake(HandshakeMessage {
            id: self.id.clone(),
            file_name: metadata.map(|m| m.file_name.clone()),
            file_size: metadata.map(|m| m.file_size),
            file_hash: metadata.map(|m| m.file_hash.clone()),
            piece_size: metadata.map(|m| m.piece_size),
            port: self.port,
        })
    }

    fn send_to(peer: &Peer, message: &Message) {
        if let Some(connection) = &peer.connection {
            let _ = connection.send(message);
        }
    }

    /// Route one decoded message. `peer_id` is the id this connection was
    /// bound to by an earlier handshake, if any.
    pub fn dispatch(
        &mut self,
        handle: &ConnectionHandle,
        remote_ip: IpAddr,
        peer_id: Option<&str>,
        message: Message,
    ) -> Result<Verdict, SwarmError> {
        let message = match message {
            Message::Handshake(handshake) => {
                return self.on_handshake(handle, remote_ip, handshake)
            }
            message => message,
        };
        let Some(peer_id) = peer_id else {
            self.log(format!("Message from {remote_ip} before handshake, ignoring"));
            return Ok(Verdict::Continue);
        };
        match message {
            Message::Bitfield(bitfield) => self.on_bitfield(peer_id, bitfield)?,
            Message::Request(request) => self.on_request(peer_id, request)?,
            Message::Piece(piece) => self.on_piece(peer_id, piece)?,
            Message::Have(have) => self.on_have(peer_id, have)?,
            Message::Peers(peers) => self.on_peers(peers)?,
            Message::Handshake(_) => unreachable!(),
        }
        Ok(Verdict::Continue)
    }

    fn on_handshake(
        &mut self,
        handle: &ConnectionHandle,
        remote_ip: IpAddr,
        handshake: HandshakeMessage,
    ) -> Result<Verdict, SwarmError> {
        let remote_id = handshake.id.clone();
        if remote_id == self.id {
            self.log(format!(
                "Dropping connection from {remote_ip}: peer advertises our own id"
            ));
            self.peers.remove(&remote_id);
            return Ok(Verdict::Close);
        }

        // upsert the record and attach this connection, superseding any
        // previous one; the superseded connection's outstanding request is
        // unaccounted for, so its pending entries are released as well
        let attached = handle.try_clone()?;
        let peer = self
            .peers
            .entry(remote_id.clone())
            .or_insert_with(|| Peer::new(remote_ip.to_string(), handshake.port));
        peer.host = remote_ip.to_string();
        peer.port = handshake.port;
        let superseded = match peer.connection.take() {
            Some(previous) if previous.id() != attached.id() => {
                previous.close();
                true
            }
            _ => false,
        };
        peer.connection = Some(attached);
        peer.handshake_sent = matches!(handle.direction(), Direction::Outbound);
        if superseded {
            peer.busy = false;
            self.pending.clear();
        }
        self.run_scheduler();

        if self.is_seed {
            if let (Some(local), Some(remote_hash)) =
                (self.metadata.as_ref(), handshake.file_hash.as_ref())
            {
                if *remote_hash != local.file_hash {
                    println!(
                        "{}: Rejecting peer {remote_id}: it shares a different file",
                        timestr()
                    );
                    self.peers.remove(&remote_id);
                    return Ok(Verdict::Close);
                }
            }
        }
        if self.metadata.is_none() {
            match Metadata::from_handshake(&handshake) {
                Some(metadata) => self.adopt_metadata(metadata)?,
                None => {
                    self.log(format!(
                        "Dropping peer {remote_id}: neither side has file metadata"
                    ));
                    self.peers.remove(&remote_id);
                    return Ok(Verdict::Close);
                }
            }
        }

        // an inbound connection replies once the remote has introduced itself
        let reply = self.handshake_message();
        let bitfield = (!self.have.is_empty()).then(|| {
            Message::Bitfield(BitfieldMessage {
                pieces: self.have.iter().copied().collect(),
            })
        });
        let peer = self
            .peers
            .get_mut(&remote_id)
            .ok_or_else(|| swarmerr!("Peer record for {remote_id} vanished"))?;
        if matches!(handle.direction(), Direction::Inbound) && !peer.handshake_sent {
            let _ = handle.send(&reply);
            peer.handshake_sent = true;
        }
        peer.handshake_received = true;
        if let Some(bitfield) = bitfield {
            let _ = handle.send(&bitfield);
        }

        if matches!(handle.direction(), Direction::Inbound) {
            self.exchange_peers(&remote_id, handle);
        }

        self.log(format!("Handshake complete with {remote_id} ({remote_ip})"));
        Ok(Verdict::Register(remote_id))
    }

    /// Peer exchange: introduce the new arrival and the rest of the swarm to
    /// each other.
    fn exchange_peers(&mut self, new_id: &str, handle: &ConnectionHandle) {
        let known: Vec<PeerInfo> = self
            .peers
            .iter()
            .filter(|(id, peer)| *id != new_id && peer.is_connected())
            .map(|(id, peer)| PeerInfo {
                id: id.clone(),
                host: peer.host.clone(),
                port: peer.port,
            })
            .collect();
        let _ = handle.send(&Message::Peers(PeersMessage { peers: known }));

        if let Some(new_peer) = self.peers.get(new_id) {
            let advert = Message::Peers(PeersMessage {
                peers: vec![PeerInfo {
                    id: new_id.to_string(),
                    host: new_peer.host.clone(),
                    port: new_peer.port,
                }],
            });
            for (id, peer) in &self.peers {
                if id != new_id && peer.is_connected() {
                    Self::send_to(peer, &advert);
                }
            }
        }
    }

    fn adopt_metadata(&mut self, metadata: Metadata) -> Result<(), SwarmError> {
        println!(
            "{}: Downloading {} ({} bytes, {} pieces of {} bytes)",
            timestr(),
            metadata.file_name,
            metadata.file_size,
            metadata.num_pieces(),
            metadata.piece_size
        );
        self.store.set_size(metadata.file_size)?;
        self.missing = (0..metadata.num_pieces()).collect();
        self.have.clear();
        self.pending.clear();
        self.start_time = Some(SystemTime::now());
        self.metadata = Some(metadata);
        if let Some(board) = self.board.upgrade() {
            let board = Arc::downgrade(&board);
            let shutdown = self.shutdown.clone();
            thread::spawn(move || monitor::monitor(board, shutdown));
        }
        if self.missing.is_empty() {
            self.finish_download()?;
        }
        Ok(())
    }

    fn on_bitfield(&mut self, peer_id: &str, bitfield: BitfieldMessage) -> Result<(), SwarmError> {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.available = bitfield.pieces.into_iter().collect();
        }
        self.run_scheduler();
        Ok(())
    }

    fn on_have(&mut self, peer_id: &str, have: HaveMessage) -> Result<(), SwarmError> {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return Ok(());
        };
        peer.available.insert(have.index);
        let wanted = self.missing.contains(&have.index) && !self.pending.contains(&have.index);
        if wanted && !peer.busy {
            self.run_scheduler();
        }
        Ok(())
    }

    fn on_request(&mut self, peer_id: &str, request: RequestMessage) -> Result<(), SwarmError> {
        if !self.have.contains(&request.index) {
            println!(
                "{}: Peer {peer_id} requested piece {} which we do not hold, ignoring",
                timestr(),
                request.index
            );
            return Ok(());
        }
        let piece_size = self
            .metadata
            .as_ref()
            .map(|m| m.piece_size)
            .ok_or_else(|| swarmerr!("Request received before metadata is known"))?;
        let data = self.store.read_piece(request.index, piece_size)?;
        if let Some(peer) = self.peers.get(peer_id) {
            Self::send_to(peer, &Message::Piece(PieceMessage::new(request.index, &data)));
        }
        Ok(())
    }

    fn on_piece(&mut self, peer_id: &str, piece: PieceMessage) -> Result<(), SwarmError> {
        let index = piece.index;
        let bytes = piece.bytes()?;
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.busy = false;
        }
        if !self.missing.contains(&index) {
            self.log(format!("Duplicate piece {index} from {peer_id}, ignoring"));
            self.run_scheduler();
            return Ok(());
        }
        let piece_size = self
            .metadata
            .as_ref()
            .map(|m| m.piece_size)
            .ok_or_else(|| swarmerr!("Piece received before metadata is known"))?;
        if let Err(err) = self.store.write_piece(index, piece_size, &bytes) {
            // the piece stays missing and reschedulable
            self.pending.remove(&index);
            self.run_scheduler();
            return Err(err);
        }
        self.have.insert(index);
        self.missing.remove(&index);
        self.pending.remove(&index);
        self.bytes_downloaded += bytes.len() as u64;
        self.log(format!(
            "Received piece {index} ({} bytes) from {peer_id}",
            bytes.len()
        ));

        // peers must observe our new availability before the scheduler asks
        // anyone for more work
        let announce = Message::Have(HaveMessage { index });
        for (id, peer) in &self.peers {
            if id != peer_id && peer.is_connected() {
                Self::send_to(peer, &announce);
            }
        }

        if self.missing.is_empty() {
            self.finish_download()?;
        } else {
            self.run_scheduler();
        }
        Ok(())
    }

    fn on_peers(&mut self, peers: PeersMessage) -> Result<(), SwarmError> {
        for info in peers.peers {
            if info.id == self.id || self.peers.contains_key(&info.id) {
                continue;
            }
            self.log(format!(
                "Learned of peer {} at {}:{}",
                info.id, info.host, info.port
            ));
            self.peers
                .insert(info.id.clone(), Peer::new(info.host.clone(), info.port));
            if should_initiate(&self.id, &info.id) {
                self.spawn_dial(info.host, info.port);
            }
        }
        Ok(())
    }

    /// Single scheduling pass: every idle connected peer is assigned the
    /// first piece it advertises that is still missing and not yet pending.
    /// At most one request is outstanding per peer.
    fn run_scheduler(&mut self) {
        let Node {
            peers,
            missing,
            pending,
            ..
        } = self;
        for peer in peers.values_mut() {
            if peer.busy || !peer.is_connected() {
                continue;
            }
            let Some(index) = peer
                .available
                .iter()
                .copied()
                .find(|index| missing.contains(index) && !pending.contains(index))
            else {
                continue;
            };
            pending.insert(index);
            peer.busy = true;
            Self::send_to(peer, &Message::Request(RequestMessage { index }));
        }
    }

    fn finish_download(&mut self) -> Result<(), SwarmError> {
        self.is_seed = true;
        let elapsed = self
            .start_time
            .and_then(|start| start.elapsed().ok())
            .unwrap_or_default();
        println!(
            "{}: Download complete: {} bytes received in {:.1}s, seeding from here on",
            timestr(),
            self.bytes_downloaded,
            elapsed.as_secs_f64()
        );
        if let Some(expected) = self.metadata.as_ref().map(|m| m.file_hash.clone()) {
            let actual = self.store.compute_hash()?;
            if actual == expected {
                println!("{}: File hash verified ({actual})", timestr());
            } else {
                println!(
                    "{}: WARNING: file hash mismatch: expected {expected}, got {actual}",
                    timestr()
                );
            }
        }
        Ok(())
    }

    /// Connection teardown: drop the peer's back-reference if it still
    /// points at this connection, conservatively release every pending
    /// request, and reschedule.
    pub fn connection_closed(&mut self, connection_id: u64, peer_id: Option<&str>) {
        let Some(peer_id) = peer_id else { return };
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        let current = peer
            .connection
            .as_ref()
            .map_or(false, |connection| connection.id() == connection_id);
        if current {
            peer.connection = None;
            peer.busy = false;
            self.log(format!("Connection to {peer_id} closed"));
            self.pending.clear();
            self.run_scheduler();
        }
    }

    /// Dial a peer on a fresh thread; a failed dial leaves the peer record
    /// without a connection and is not retried.
    pub fn spawn_dial(&self, host: String, port: u16) {
        let Some(board) = self.board.upgrade() else {
            return;
        };
        thread::spawn(move || {
            if let Err(err) = connection::connect(board, &host, port) {
                println!("{}: Connection to {host}:{port} failed: {err}", timestr());
            }
        });
    }
}

pub struct NodeHandle {
    pub board: Arc<RwLock<Node>>,
    pub port: u16,
    shutdown: Arc<AtomicBool>,
    listener: JoinHandle<Result<(), SwarmError>>,
}

impl NodeHandle {
    /// Raise the shutdown flag, wait for the listener to wind down, and
    /// release the file handle.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.listener.join();
        if let Ok(mut node) = self.board.write() {
            node.store.close();
        }
    }

    /// Block until the listener exits; for the CLI this means running until
    /// the process is signalled.
    pub fn join(self) -> Result<(), SwarmError> {
        self.listener
            .join()
            .map_err(|_| swarmerr!("Listener thread panicked"))?
    }
}

/// Bring a node up: probe the file to decide seed or leecher, bind the
/// listener, and dial the bootstrap peer if one was configured.
pub fn spawn(config: Config) -> Result<NodeHandle, SwarmError> {
    let id = generate_id();
    let file_name = config
        .file
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| swarmerr!("Invalid file path {}", config.file.display()))?;

    let is_seed = config.file.exists();
    let (store, metadata) = if is_seed {
        let mut store = FileStore::open(&config.file)?;
        let file_size = store
            .size()
            .ok_or_else(|| swarmerr!("File size is not known"))?;
        let piece_size = file_size.min(DEFAULT_PIECE_SIZE);
        let file_hash = store.compute_hash()?;
        let metadata = Metadata {
            file_name,
            file_size,
            piece_size,
            file_hash,
        };
        (store, Some(metadata))
    } else {
        (FileStore::create(&config.file)?, None)
    };

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .with_context(|| format!("Error binding port {}", config.port))?;
    let port = listener.local_addr()?.port();

    let have: BTreeSet<usize> = metadata
        .as_ref()
        .map(|metadata| (0..metadata.num_pieces()).collect())
        .unwrap_or_default();

    match &metadata {
        Some(metadata) => println!(
            "{}: Seeding {} ({} bytes, {} pieces, hash {}) as {id} on port {port}",
            timestr(),
            metadata.file_name,
            metadata.file_size,
            metadata.num_pieces(),
            metadata.file_hash
        ),
        None => println!(
            "{}: Leeching into {} as {id} on port {port}",
            timestr(),
            config.file.display()
        ),
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let node = Node {
        id,
        port,
        metadata,
        store,
        have,
        missing: BTreeSet::new(),
        pending: BTreeSet::new(),
        peers: HashMap::new(),
        bytes_downloaded: 0,
        start_time: None,
        is_seed,
        verbose: config.verbose,
        shutdown: shutdown.clone(),
        board: Weak::new(),
        next_connection_id: 0,
    };

    let board = Arc::new(RwLock::new(node));
    board.write()?.board = Arc::downgrade(&board);

    let listener_board = board.clone();
    let listener = thread::spawn(move || listener::listen(listener_board, listener));

    match config.peer {
        Some((host, peer_port)) => board.read()?.spawn_dial(host, peer_port),
        None => {
            if !is_seed {
                println!(
                    "{}: No bootstrap peer configured; waiting for an inbound peer to find us",
                    timestr()
                );
            }
        }
    }

    Ok(NodeHandle {
        board,
        port,
        shutdown,
        listener,
    })
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        io::{BufRead, BufReader, Read, Write},
        net::TcpStream,
        path::Path,
        time::Duration,
    };

    use tempfile::TempDir;

    use crate::util::sleep;

    use super::*;

    const WAIT: u64 = 15_000;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
    }

    fn spawn_seed(path: &Path) -> NodeHandle {
        spawn(Config {
            port: 0,
            file: path.to_path_buf(),
            peer: None,
            verbose: false,
        })
        .unwrap()
    }

    fn spawn_leecher(path: &Path, peer_port: u16) -> NodeHandle {
        spawn(Config {
            port: 0,
            file: path.to_path_buf(),
            peer: Some(("127.0.0.1".to_string(), peer_port)),
            verbose: false,
        })
        .unwrap()
    }

    fn wait_for(handle: &NodeHandle, predicate: impl Fn(&Node) -> bool) -> bool {
        let mut waited = 0;
        while waited < WAIT {
            if predicate(&handle.board.read().unwrap()) {
                return true;
            }
            sleep(20);
            waited += 20;
        }
        false
    }

    fn connect_raw(port: u16) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }

    fn send_raw(stream: &mut TcpStream, message: &Message) {
        stream.write_all(&message.encode().unwrap()).unwrap();
    }

    fn read_raw(reader: &mut BufReader<TcpStream>) -> Message {
        loop {
            let mut line = String::new();
            assert!(reader.read_line(&mut line).unwrap() > 0, "connection closed");
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(line.trim()).unwrap();
        }
    }

    fn reads_to_eof(stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    }

    fn fake_handshake(id: &str, metadata: Option<(u64, u64, &str)>, port: u16) -> Message {
        Message::Handshake(HandshakeMessage {
            id: id.to_string(),
            file_name: metadata.map(|_| "fake.bin".to_string()),
            file_size: metadata.map(|(size, _, _)| size),
            file_hash: metadata.map(|(_, _, hash)| hash.to_string()),
            piece_size: metadata.map(|(_, piece, _)| piece),
            port,
        })
    }

    #[test]
    fn initiate_rule_breaks_every_pair_exactly_once() {
        let ids = [
            "0000000000000000",
            "0123456789abcdef",
            "89abcdef01234567",
            "ffffffffffffffff",
        ];
        for a in ids {
            for b in ids {
                if a != b {
                    assert_ne!(should_initiate(a, b), should_initiate(b, a));
                }
            }
        }
        assert!(should_initiate("ff00000000000000", "0000000000000000"));
        assert!(!should_initiate("0000000000000000", "ff00000000000000"));
    }

    #[test]
    fn num_pieces_rounds_up_for_a_ragged_tail() {
        let metadata = Metadata {
            file_name: "f".to_string(),
            file_size: 100,
            piece_size: 64,
            file_hash: "00".repeat(20),
        };
        assert_eq!(metadata.num_pieces(), 2);

        let exact = Metadata {
            file_size: 128,
            ..metadata.clone()
        };
        assert_eq!(exact.num_pieces(), 2);

        let empty = Metadata {
            file_size: 0,
            piece_size: 0,
            ..metadata
        };
        assert_eq!(empty.num_pieces(), 0);
    }

    #[test]
    fn small_seed_collapses_piece_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("small.bin");
        fs::write(&path, payload(100)).unwrap();
        let seed = spawn_seed(&path);
        {
            let node = seed.board.read().unwrap();
            let metadata = node.metadata.as_ref().unwrap();
            assert!(node.is_seed);
            assert_eq!(metadata.piece_size, 100);
            assert_eq!(metadata.num_pieces(), 1);
            assert_eq!(node.have.iter().copied().collect::<Vec<_>>(), vec![0]);
            assert!(node.missing.is_empty());
        }
        seed.shutdown();
    }

    #[test]
    fn leecher_downloads_from_seed() {
        let dir = TempDir::new().unwrap();
        let contents = payload(200_000);
        let source = dir.path().join("source.bin");
        fs::write(&source, &contents).unwrap();
        let seed = spawn_seed(&source);

        let dest = dir.path().join("copy.bin");
        let leecher = spawn_leecher(&dest, seed.port);
        assert!(wait_for(&leecher, |node| node.is_seed));

        assert_eq!(fs::read(&dest).unwrap(), contents);
        {
            let node = leecher.board.read().unwrap();
            let metadata = node.metadata.as_ref().unwrap();
            assert_eq!(
                metadata.file_hash,
                seed.board.read().unwrap().metadata.as_ref().unwrap().file_hash
            );
            assert_eq!(node.have.len(), metadata.num_pieces());
            assert!(node.missing.is_empty());
            assert!(node.pending.is_empty());
        }
        leecher.shutdown();
        seed.shutdown();
    }

    #[test]
    fn swarm_interconnects_via_peer_exchange() {
        let dir = TempDir::new().unwrap();
        let contents = payload(150_000);
        let source = dir.path().join("source.bin");
        fs::write(&source, &contents).unwrap();
        let seed = spawn_seed(&source);

        let dest_a = dir.path().join("a.bin");
        let dest_b = dir.path().join("b.bin");
        let leecher_a = spawn_leecher(&dest_a, seed.port);
        let leecher_b = spawn_leecher(&dest_b, seed.port);

        assert!(wait_for(&leecher_a, |node| node.is_seed));
        assert!(wait_for(&leecher_b, |node| node.is_seed));
        assert_eq!(fs::read(&dest_a).unwrap(), contents);
        assert_eq!(fs::read(&dest_b).unwrap(), contents);

        // the leechers only ever dialed the seed; knowing each other proves
        // the gossip worked
        let id_a = leecher_a.board.read().unwrap().id.clone();
        let id_b = leecher_b.board.read().unwrap().id.clone();
        assert!(wait_for(&leecher_a, |node| node.peers.contains_key(&id_b)));
        assert!(wait_for(&leecher_b, |node| node.peers.contains_key(&id_a)));

        leecher_a.shutdown();
        leecher_b.shutdown();
        seed.shutdown();
    }

    #[test]
    fn completed_leecher_serves_new_peers() {
        let dir = TempDir::new().unwrap();
        let contents = payload(100_000);
        let source = dir.path().join("source.bin");
        fs::write(&source, &contents).unwrap();
        let seed = spawn_seed(&source);

        let first = dir.path().join("first.bin");
        let leecher = spawn_leecher(&first, seed.port);
        assert!(wait_for(&leecher, |node| node.is_seed));
        seed.shutdown();

        let second = dir.path().join("second.bin");
        let follower = spawn_leecher(&second, leecher.port);
        assert!(wait_for(&follower, |node| node.is_seed));
        assert_eq!(fs::read(&second).unwrap(), contents);

        follower.shutdown();
        leecher.shutdown();
    }

    #[test]
    fn seed_rejects_peer_sharing_a_different_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.bin");
        fs::write(&path, payload(100)).unwrap();
        let seed = spawn_seed(&path);

        let mut stream = connect_raw(seed.port);
        send_raw(
            &mut stream,
            &fake_handshake("00000000000000aa", Some((100, 100, &"ff".repeat(20))), 1),
        );
        assert!(reads_to_eof(&mut stream));
        assert!(wait_for(&seed, |node| !node
            .peers
            .contains_key("00000000000000aa")));
        seed.shutdown();
    }

    #[test]
    fn self_handshake_is_dropped_without_state_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.bin");
        fs::write(&path, payload(100)).unwrap();
        let seed = spawn_seed(&path);
        let own_id = seed.board.read().unwrap().id.clone();

        let mut stream = connect_raw(seed.port);
        send_raw(&mut stream, &fake_handshake(&own_id, None, 1));
        assert!(reads_to_eof(&mut stream));
        {
            let node = seed.board.read().unwrap();
            assert!(node.peers.is_empty());
            assert_eq!(node.have.len(), 1);
            assert!(node.missing.is_empty());
        }
        seed.shutdown();
    }

    #[test]
    fn handshake_with_no_metadata_on_either_side_closes() {
        let dir = TempDir::new().unwrap();
        let leecher = spawn(Config {
            port: 0,
            file: dir.path().join("dest.bin"),
            peer: None,
            verbose: false,
        })
        .unwrap();

        let mut stream = connect_raw(leecher.port);
        send_raw(&mut stream, &fake_handshake("00000000000000bb", None, 1));
        assert!(reads_to_eof(&mut stream));
        assert!(wait_for(&leecher, |node| node.peers.is_empty()));
        leecher.shutdown();
    }

    #[test]
    fn seed_answers_requests_and_ignores_unheld_indices() {
        let dir = TempDir::new().unwrap();
        let contents = payload(100);
        let path = dir.path().join("shared.bin");
        fs::write(&path, &contents).unwrap();
        let seed = spawn_seed(&path);

        let mut stream = connect_raw(seed.port);
        // a line of garbage must be dropped without closing the connection
        stream.write_all(b"this is not json\n").unwrap();
        send_raw(&mut stream, &fake_handshake("00000000000000cc", None, 1));

        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let Message::Handshake(reply) = read_raw(&mut reader) else {
            panic!("expected a handshake reply");
        };
        assert_eq!(reply.file_size, Some(100));
        let Message::Bitfield(bitfield) = read_raw(&mut reader) else {
            panic!("expected a bitfield");
        };
        assert_eq!(bitfield.pieces, vec![0]);
        let Message::Peers(peers) = read_raw(&mut reader) else {
            panic!("expected a peer exchange");
        };
        assert!(peers.peers.is_empty());

        send_raw(&mut stream, &Message::Request(RequestMessage { index: 5 }));
        send_raw(&mut stream, &Message::Request(RequestMessage { index: 0 }));
        let Message::Piece(piece) = read_raw(&mut reader) else {
            panic!("expected a piece");
        };
        assert_eq!(piece.index, 0);
        assert_eq!(piece.bytes().unwrap(), contents);
        seed.shutdown();
    }

    #[test]
    fn closing_a_connection_releases_pending_requests() {
        let dir = TempDir::new().unwrap();
        let leecher = spawn(Config {
            port: 0,
            file: dir.path().join("dest.bin"),
            peer: None,
            verbose: false,
        })
        .unwrap();

        let mut stream = connect_raw(leecher.port);
        send_raw(
            &mut stream,
            &fake_handshake("00000000000000dd", Some((100, 64, &"aa".repeat(20))), 1),
        );
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        assert!(matches!(read_raw(&mut reader), Message::Handshake(_)));
        assert!(matches!(read_raw(&mut reader), Message::Peers(_)));

        send_raw(
            &mut stream,
            &Message::Bitfield(BitfieldMessage { pieces: vec![0, 1] }),
        );
        let Message::Request(request) = read_raw(&mut reader) else {
            panic!("expected a request");
        };
        assert_eq!(request.index, 0);
        {
            let node = leecher.board.read().unwrap();
            assert!(node.pending.contains(&0));
            assert!(node.peers.get("00000000000000dd").unwrap().busy);
        }

        drop(reader);
        drop(stream);
        assert!(wait_for(&leecher, |node| node.pending.is_empty()
            && !node.peers.get("00000000000000dd").unwrap().is_connected()));
        leecher.shutdown();
    }
}
