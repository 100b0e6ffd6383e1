use std::{
    io,
    net::TcpListener,
    sync::{atomic::Ordering, Arc, RwLock},
    thread,
};

use crate::{
    error::SwarmError,
    util::{sleep, timestr},
};

use super::{
    connection::{self, Direction},
    Node,
};

/// time in between non-blocking accept attempts (milliseconds)
const INTERVAL: u64 = 250;

/// Accept loop: spawns a reader thread per inbound connection until the
/// node's shutdown flag is raised.
pub fn listen(board: Arc<RwLock<Node>>, listener: TcpListener) -> Result<(), SwarmError> {
    let (verbose, shutdown) = {
        let node = board.read()?;
        (node.verbose, node.shutdown.clone())
    };
    let log = |msg: String| {
        if verbose {
            println!("[{}][L] {msg}", timestr())
        }
    };

    listener.set_nonblocking(true)?;
    log(format!(
        "Listening on port {}",
        listener.local_addr()?.port()
    ));

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let address = stream
                    .peer_addr()
                    .map(|address| address.to_string())
                    .unwrap_or_else(|_| "<unknown>".to_string());
                log(format!("New connection from {address}"));
                // accepted sockets can inherit the listener's non-blocking
                // flag on some platforms
                if let Err(err) = stream.set_nonblocking(false) {
                    log(format!("Failed to configure socket for {address}: {err}"));
                    continue;
                }
                let board = board.clone();
                thread::spawn(move || {
                    if let Err(err) = connection::drive(board, stream, Direction::Inbound) {
                        println!(
                            "{}: Connection from {address} ended with error: {err}",
                            timestr()
                        );
                    }
                });
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                sleep(INTERVAL);
            }
            Err(err) => log(format!("Tcp listener error: {err}")),
        }
    }
    Ok(())
}
