use std::path::PathBuf;

use clap::{ArgAction, Parser};

use error::SwarmError;
use node::Config;

mod error;
mod message;
mod node;
mod storage;
mod util;

/// Trackerless peer-to-peer file sharing node
#[derive(Parser)]
#[clap(about, version)]
struct Args {
    /// TCP port to listen on for peer connections
    #[arg(short, long)]
    port: u16,

    /// File to share if it already exists, otherwise the destination path
    /// to download into
    #[arg(short, long)]
    file: PathBuf,

    /// Initial peer to connect to, as host:port
    #[arg(long, value_parser = peer_validator)]
    peer: Option<(String, u16)>,

    /// Print verbose logging information
    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

/// Validate peer host:port format. The split is at the last colon so IPv6
/// literals keep their own colons.
fn peer_validator(val: &str) -> Result<(String, u16), String> {
    let (host, port) = val
        .rsplit_once(':')
        .ok_or_else(|| format!("'{val}' is not in host:port format"))?;
    if host.is_empty() {
        return Err(format!("'{val}' has an empty host"));
    }
    let port = port
        .parse()
        .map_err(|err| format!("invalid port in '{val}': {err}"))?;
    Ok((host.to_string(), port))
}

fn main() -> Result<(), SwarmError> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            if matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) {
                err.exit();
            }
            let _ = err.print();
            std::process::exit(1);
        }
    };

    let handle = node::spawn(Config {
        port: args.port,
        file: args.file,
        peer: args.peer,
        verbose: args.verbose,
    })?;
    handle.join()
}
