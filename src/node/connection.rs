use std::{
    io::{Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::{Arc, RwLock},
    time::Duration,
};

use anyhow::Context;

use crate::{
    error::SwarmError,
    message::{Message, MessageCodec},
    swarmerr,
    util::timestr,
};

use super::{Node, Verdict};

/// connection timeout when dialing a peer's tcp socket
const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);
/// inbound lines longer than this close the connection
const MAX_FRAME_LEN: usize = 8 << 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Write half of a connection, held by the owning peer record. Cheap to
/// clone via the underlying socket handle; the connection id ties the
/// record's back-reference to one particular socket so a reconnect cannot
/// be torn down by the thread of the connection it superseded.
pub struct ConnectionHandle {
    id: u64,
    direction: Direction,
    stream: TcpStream,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn try_clone(&self) -> Result<Self, SwarmError> {
        Ok(Self {
            id: self.id,
            direction: self.direction,
            stream: self.stream.try_clone()?,
        })
    }

    /// Serialize and write one message. Fire-and-forget: a failed send is
    /// surfaced to the caller, but teardown is left to the reader side,
    /// which will observe the broken socket.
    pub fn send(&self, message: &Message) -> Result<(), SwarmError> {
        let line = message.encode()?;
        (&self.stream)
            .write_all(&line)
            .with_context(|| "Error sending peer message")?;
        Ok(())
    }

    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Dial a peer and run the connection until it ends.
pub fn connect(board: Arc<RwLock<Node>>, host: &str, port: u16) -> Result<(), SwarmError> {
    let address = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("Error resolving {host}:{port}"))?
        .next()
        .ok_or_else(|| swarmerr!("No address found for {host}:{port}"))?;
    let stream = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT)
        .with_context(|| "Error connecting to peer")?;
    drive(board, stream, Direction::Outbound)
}

/// Reader loop for one connection, inbound or outbound. Owns the read half
/// of the socket; every decoded message is dispatched into the node under
/// the write lock, strictly in arrival order.
pub fn drive(
    board: Arc<RwLock<Node>>,
    stream: TcpStream,
    direction: Direction,
) -> Result<(), SwarmError> {
    let remote = stream
        .peer_addr()
        .with_context(|| "Error reading remote address")?;
    let verbose = board.read()?.verbose;
    let log = |msg: String| {
        if verbose {
            println!("[{}][{}] {msg}", timestr(), remote)
        }
    };

    let handle = ConnectionHandle {
        id: board.write()?.next_connection_id(),
        direction,
        stream: stream.try_clone()?,
    };
    log(format!("Connection established ({direction:?})"));

    // an outbound connection introduces itself immediately; an inbound one
    // waits for the remote's handshake before replying
    if direction == Direction::Outbound {
        let handshake = board.read()?.handshake_message();
        handle.send(&handshake)?;
    }

    let mut stream = stream;
    let mut codec = MessageCodec::new();
    let mut peer_id: Option<String> = None;
    let mut buffer = [0u8; 8192];
    let result = 'session: loop {
        let read = match stream.read(&mut buffer) {
            Ok(0) => break Ok(()),
            Ok(read) => read,
            Err(err) => break Err(SwarmError::from(err)),
        };
        codec.feed(&buffer[..read]);
        while let Some(decoded) = codec.next() {
            let message = match decoded {
                Ok(message) => message,
                Err(err) => {
                    println!(
                        "{}: Unparseable message from {remote}, dropping it: {err}",
                        timestr()
                    );
                    continue;
                }
            };
            let verdict = board
                .write()?
                .dispatch(&handle, remote.ip(), peer_id.as_deref(), message);
            match verdict {
                Ok(Verdict::Continue) => {}
                Ok(Verdict::Register(id)) => peer_id = Some(id),
                Ok(Verdict::Close) => break 'session Ok(()),
                Err(err) => println!(
                    "{}: Error handling message from {remote}: {err}",
                    timestr()
                ),
            }
        }
        if codec.buffered() > MAX_FRAME_LEN {
            break Err(swarmerr!("Frame from {remote} exceeds {MAX_FRAME_LEN} bytes"));
        }
    };

    log("Tearing down connection".to_string());
    handle.close();
    board
        .write()?
        .connection_closed(handle.id(), peer_id.as_deref());
    result
}
