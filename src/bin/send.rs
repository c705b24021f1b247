use clap::Parser;
use clap_derive::Parser;
use ruft::channel::UdpChannel;
use ruft::config::RuftConfig;
use ruft::payload::PayloadSource;
use ruft::sender::Sender;
use std::net::SocketAddr;
use std::path::PathBuf;
use anyhow::anyhow;
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    /// receiver address, e.g. 127.0.0.1:9000
    receiver: String,

    /// file to transfer
    #[clap(long)]
    input: Option<PathBuf>,

    /// send this many bytes of a generated test pattern instead of a file
    #[clap(long)]
    synthetic: Option<u64>,

    /// give up if the whole transfer takes longer than this many seconds
    #[clap(long)]
    deadline_secs: Option<u64>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let peer: SocketAddr = args.receiver.parse()?;

    let mut source = match (&args.input, args.synthetic) {
        (Some(path), None) => PayloadSource::file(path).await?,
        (None, Some(total)) => PayloadSource::synthetic(total),
        _ => return Err(anyhow!("exactly one of --input and --synthetic must be given")),
    };

    let mut config = RuftConfig::new();
    config.overall_deadline = args.deadline_secs.map(std::time::Duration::from_secs);

    let bind_addr: SocketAddr = if peer.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let channel = UdpChannel::bind(bind_addr, config.max_datagram_size()).await?;

    info!("sending {} bytes to {}", source.total_bytes(), peer);
    let mut sender = Sender::connect(channel, peer, config).await?;
    let stats = sender.run(&mut source).await?;

    info!(
        "transfer finished: {} bytes in {} segments, {} retransmissions, {:.1} KiB/s",
        stats.bytes_sent,
        stats.segments_sent,
        stats.retransmissions,
        stats.throughput_kib_per_sec(),
    );
    Ok(())
}
