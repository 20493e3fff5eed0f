// This is an implementation of a TFTP client compliant with RFC 1350, extended with option
// negotiation (RFC 2347) for block size (RFC 2348), timeout and transfer size (RFC 2349).
//
// A read begins with a request (RRQ) sent to the server's well-known port 69. The server answers
// from a port of its own choosing, its transfer identifier (TID), and every later packet of the
// session goes to that port. Packets arriving from any other port are answered with an error and
// otherwise ignored.
//
// RRQ packet format, with options appended after the mode:
// 0x01 | Filename | 0x00 | Mode | 0x00 | opt1 | 0x00 | value1 | 0x00 | ...
//
// If the server understands at least one option it answers with an option acknowledgement:
// 0x06 | opt1 | 0x00 | value1 | 0x00 | ...
//
// The client confirms the OACK with an ACK for block 0. A server that does not understand options
// skips the OACK and sends block 1 straight away, in which case every option keeps its default.
//
// DATA packet:
// 0x03 | Block # (2 bytes) | Data (0-blksize bytes)
//
// ACK packet:
// 0x04 | Block # (2 bytes)
//
// ERROR packet:
// 0x05 | ErrorCode (2 bytes) | ErrMsg | 0x00
//
// Every DATA block is acknowledged before the next one is sent. A block shorter than the
// negotiated block size ends the transfer. Block numbers are 16 bits and wrap from 65535 to 0.
//
// If an ACK is lost the server sends the same DATA block again. The client recognizes the
// duplicate by comparing it with the last datagram it accepted, and repeats its last ACK without
// writing the data a second time. Any other out-of-order block aborts the transfer.
//
// An ERROR packet ends the transfer immediately. It is not acknowledged.
//
// Options:
// - blksize: accepted only if the server echoes the offered value, otherwise 512 is used.
// - timeout: offered only when nonzero, accepted only if echoed.
// - tsize: offered as 0, the server answers with the size of the file.
//
// In netascii mode, line endings arrive as CR LF and bare carriage returns as CR NUL; both are
// converted back while writing the file.

pub mod client_conn;
pub mod netascii;
pub mod options;
pub mod processor;
pub mod tftp;
pub mod transport;

use client_conn::ClientRequestHandler;
use processor::{ReadProcessor, ReadRequestConfig};
use transport::TftpSocket;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs::File;

/// Client for transferring files through the Trivial File Transfer Protocol
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Read file from server. Do not combine with -W
    #[arg(short = 'R', long = "read", conflicts_with = "write")]
    read: bool,

    /// Write file to server. Do not combine with -R
    #[arg(short = 'W', long = "write")]
    write: bool,

    /// Remote file path
    #[arg(short = 'd', long = "file")]
    file: String,

    /// Local file to write, defaults to the last component of the remote path
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Timeout in seconds. 0 = no timeout
    #[arg(short = 't', long = "timeout", default_value_t = 0)]
    timeout: u8,

    /// Maximum block size. Bounded by the MTU ceiling
    #[arg(short = 's', long = "size")]
    size: Option<u16>,

    /// Smallest MTU of the network interfaces, used as the block size ceiling
    #[arg(short = 'u', long = "mtu", default_value_t = 1500)]
    mtu: u16,

    /// Transfer mode: "ascii" (or "netascii") or "binary" (or "octet")
    #[arg(short = 'c', long = "code", default_value = "binary")]
    code: String,

    /// Server address and port formatted: address,port
    #[arg(short = 'a', long = "address", default_value = "127.0.0.1,69")]
    address: String,

    /// Free space available for the file; larger announced transfers are refused
    #[arg(long = "max-size")]
    max_size: Option<u64>,
}

/// Splits `address,port` into its parts.
fn parse_server_config(conf: &str) -> Result<(String, u16)> {
    let (host, port) = conf
        .split_once(',')
        .ok_or_else(|| anyhow!("Expected address,port but got '{conf}'"))?;
    let port = port.trim().parse().with_context(|| format!("Invalid port '{port}'"))?;
    Ok((host.trim().to_string(), port))
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Could not resolve {host}"))?
        .next()
        .ok_or_else(|| anyhow!("No address found for {host}"))
}

fn default_output(remote: &str) -> PathBuf {
    Path::new(remote)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(remote))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.write {
        bail!("Write transfers are not supported");
    }
    if !args.read {
        bail!("Specify either -R for Read or -W for Write file mode.");
    }

    let mode = tftp::FileMode::from_user_str(&args.code)
        .ok_or_else(|| anyhow!("Unknown transfer mode '{}'", args.code))?;
    let block_size = options::cap_block_size(args.size, args.mtu);
    if args.size.is_some() {
        log::info!("Minimal MTU of all network interfaces is {}. Blocksize set to {}", args.mtu, block_size);
    }

    let (host, port) = parse_server_config(&args.address)?;
    let server = resolve(&host, port).await?;
    log::info!("Creating connection to server {} port {}", host, port);
    let socket = TftpSocket::connect(server).context("Could not open a UDP socket")?;

    let output = args.output.clone().unwrap_or_else(|| default_output(&args.file));
    let file = File::create(&output)
        .await
        .with_context(|| format!("Could not create {:?}", output))?;

    let config = ReadRequestConfig {
        filename: args.file.clone(),
        mode,
        block_size,
        timeout: args.timeout,
        available_space: args.max_size,
    };
    log::info!("Sending read file request with {} mode", mode.as_str());

    let mut handler = ClientRequestHandler::new(socket, ReadProcessor::new(config, file));
    match handler.handle().await {
        Ok(summary) => {
            log::info!(
                "Transfer finished: {} bytes in {} blocks written to {:?}",
                summary.bytes_written, summary.blocks, output
            );
            Ok(())
        }
        Err(e) => {
            log::error!("Transfer of {} failed: {}", args.file, e);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_config() {
        assert_eq!(parse_server_config("127.0.0.1,69").unwrap(), ("127.0.0.1".to_string(), 69));
        assert_eq!(parse_server_config("tftp.local, 6969").unwrap(), ("tftp.local".to_string(), 6969));
        assert!(parse_server_config("127.0.0.1").is_err());
        assert!(parse_server_config("127.0.0.1,port").is_err());
    }

    #[test]
    fn test_default_output() {
        assert_eq!(default_output("/srv/tftp/pxelinux.0"), PathBuf::from("pxelinux.0"));
        assert_eq!(default_output("file.txt"), PathBuf::from("file.txt"));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["tftp-client", "-R", "-d", "a.txt", "-c", "ascii", "-s", "1024"]).unwrap();
        assert!(args.read);
        assert_eq!(args.size, Some(1024));
        assert_eq!(args.address, "127.0.0.1,69");
        assert!(Args::try_parse_from(["tftp-client", "-R", "-W", "-d", "a.txt"]).is_err());
    }
}
