use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock, Weak,
};

use crate::util::{sleep, timestr};

use super::Node;

/// time between progress reports (milliseconds)
const INTERVAL: u64 = 1000;

/// Progress reporter: started when a leecher adopts file metadata, prints
/// one line per second, and exits at completion or shutdown.
///
/// Bytes done is approximated as `fileSize - missing * pieceSize`, which
/// undercounts a short tail piece by at most one piece.
pub fn monitor(board: Weak<RwLock<Node>>, shutdown: Arc<AtomicBool>) {
    loop {
        sleep(INTERVAL);
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let Some(board) = board.upgrade() else { break };
        let Ok(node) = board.read() else { break };
        let Some(metadata) = node.metadata.as_ref() else {
            continue;
        };
        if node.missing.is_empty() {
            break;
        }
        let Some(start) = node.start_time else {
            continue;
        };
        let bytes_done = metadata
            .file_size
            .saturating_sub(node.missing.len() as u64 * metadata.piece_size);
        let percent = if metadata.file_size == 0 {
            100.0
        } else {
            bytes_done as f64 * 100.0 / metadata.file_size as f64
        };
        let elapsed = start
            .elapsed()
            .unwrap_or_default()
            .as_secs_f64()
            .max(f64::EPSILON);
        let rate = bytes_done as f64 / 1024.0 / elapsed;
        println!(
            "{}: {percent:5.1}% downloaded ({bytes_done}/{} bytes, {rate:.1} KB/s)",
            timestr(),
            metadata.file_size
        );
    }
}
