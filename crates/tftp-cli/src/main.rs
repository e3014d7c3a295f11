//! TFTP server/client command line tool.

mod fileserver;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp::{Client, Mode, Server};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::fileserver::FileServer;

#[derive(FromArgs, Debug)]
#[argh(description = "TFTP server and client")]
struct Cli {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Serve(ServeArgs),
    Get(GetArgs),
    Put(PutArgs),
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "serve",
    description = "serve files from the local filesystem",
    example = "Serve the current directory read-only:\n  {command_name}",
    example = "Allow uploads into ./incoming on a non-privileged port:\n  {command_name} 0.0.0.0:6969 ./incoming --writable"
)]
struct ServeArgs {
    #[argh(
        positional,
        description = "bind address, \"host:port\"",
        default = "String::from(tftp::server::DEFAULT_BIND)"
    )]
    bind: String,

    #[argh(positional, description = "root directory to serve", default = "PathBuf::from(\".\")")]
    root: PathBuf,

    #[argh(switch, short = 'w', description = "enable file upload")]
    writable: bool,

    #[argh(switch, description = "run all transfers through the listener socket [experimental]")]
    single_port: bool,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "get", description = "download a file from a server")]
struct GetArgs {
    #[argh(positional, description = "server address, \"host:port\"")]
    server: String,

    #[argh(positional, description = "remote file path")]
    file: String,

    #[argh(option, short = 'b', default = "512", description = "number of data bytes to send per-packet")]
    blksize: u16,

    #[argh(
        option,
        short = 'w',
        default = "1",
        description = "number of packets to send before requiring an acknowledgement"
    )]
    windowsize: u16,

    #[argh(option, short = 't', default = "10", description = "seconds to wait before retransmitting")]
    timeout: u8,

    #[argh(
        option,
        short = 'r',
        default = "10",
        description = "maximum number of back-to-back lost packets before terminating"
    )]
    retransmit: u32,

    #[argh(switch, description = "disable the transfer size option")]
    no_tsize: bool,

    #[argh(switch, description = "enable netascii transfer mode")]
    netascii: bool,

    #[argh(
        option,
        short = 'o',
        description = "output location; \"-\" writes to stdout and implies --quiet"
    )]
    output: Option<String>,

    #[argh(switch, short = 'q', description = "only log warnings")]
    quiet: bool,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "put", description = "upload a file to a server")]
struct PutArgs {
    #[argh(positional, description = "server address, \"host:port\"")]
    server: String,

    #[argh(positional, description = "local file path")]
    file: String,

    #[argh(option, short = 'b', default = "512", description = "number of data bytes to send per-packet")]
    blksize: u16,

    #[argh(
        option,
        short = 'w',
        default = "1",
        description = "number of packets to send before requiring an acknowledgement"
    )]
    windowsize: u16,

    #[argh(option, short = 't', default = "10", description = "seconds to wait before retransmitting")]
    timeout: u8,

    #[argh(
        option,
        short = 'r',
        default = "10",
        description = "maximum number of back-to-back lost packets before terminating"
    )]
    retransmit: u32,

    #[argh(switch, description = "disable the transfer size option")]
    no_tsize: bool,

    #[argh(switch, description = "enable netascii transfer mode")]
    netascii: bool,

    #[argh(switch, short = 'q', description = "only log warnings")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    let quiet = match &cli.command {
        Command::Serve(_) => false,
        Command::Get(args) => args.quiet || args.output.as_deref() == Some("-"),
        Command::Put(args) => args.quiet,
    };
    let level = if quiet { tracing::Level::WARN } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Command::Serve(args) => cmd_serve(args).await,
        Command::Get(args) => cmd_get(args).await,
        Command::Put(args) => cmd_put(args).await,
    }
}

async fn cmd_serve(args: ServeArgs) -> Result<()> {
    let root = args
        .root
        .canonicalize()
        .with_context(|| format!("resolving root directory {}", args.root.display()))?;
    info!("serving {} on {}", root.display(), args.bind);

    let handler = FileServer::new(root);
    let mut server = Server::new(args.bind);
    server.single_port(args.single_port);
    server.read_handler(handler.clone());
    if args.writable {
        server.write_handler(handler);
    }
    server.serve().await.context("serving tftp")
}

async fn cmd_get(args: GetArgs) -> Result<()> {
    let client = build_client(args.blksize, args.windowsize, args.timeout, args.retransmit, args.no_tsize, args.netascii)?;
    let url = format!("{}/{}", args.server, args.file);
    let mut response = client
        .get(&url)
        .await
        .with_context(|| format!("requesting {}", url))?;
    if let Some(size) = response.size() {
        info!("transfer size: {} bytes", size);
    }

    match args.output.as_deref() {
        Some("-") => copy_response(&mut response, tokio::io::stdout()).await?,
        other => {
            let path = match other {
                Some(path) => PathBuf::from(path),
                None => Path::new(&args.file)
                    .file_name()
                    .map(PathBuf::from)
                    .context("remote file path has no file name")?,
            };
            let file = tokio::fs::File::create(&path)
                .await
                .with_context(|| format!("creating {}", path.display()))?;
            copy_response(&mut response, file).await?;
            info!("wrote {}", path.display());
        }
    }
    Ok(())
}

async fn cmd_put(args: PutArgs) -> Result<()> {
    let client = build_client(args.blksize, args.windowsize, args.timeout, args.retransmit, args.no_tsize, args.netascii)?;
    let file = tokio::fs::File::open(&args.file)
        .await
        .with_context(|| format!("opening {}", args.file))?;
    let size = file.metadata().await?.len();
    let name = Path::new(&args.file)
        .file_name()
        .and_then(|name| name.to_str())
        .context("local file name is not valid utf-8")?;

    let url = format!("{}/{}", args.server, name);
    client
        .put(&url, tokio::io::BufReader::new(file), size)
        .await
        .with_context(|| format!("uploading {}", url))?;
    info!("uploaded {} bytes", size);
    Ok(())
}

fn build_client(
    blksize: u16,
    windowsize: u16,
    timeout: u8,
    retransmit: u32,
    no_tsize: bool,
    netascii: bool,
) -> Result<Client> {
    let mode = if netascii { Mode::Netascii } else { Mode::Octet };
    let client = Client::new()
        .blocksize(blksize)?
        .windowsize(windowsize)?
        .timeout(timeout)?
        .retransmit(retransmit)
        .transfer_size(!no_tsize)
        .mode(mode);
    Ok(client)
}

async fn copy_response(response: &mut tftp::Response, mut out: impl AsyncWrite + Unpin) -> Result<()> {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = response.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).await?;
    }
    out.flush().await?;
    Ok(())
}
