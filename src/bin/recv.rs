use clap::Parser;
use clap_derive::Parser;
use ruft::channel::{LossyChannel, UdpChannel};
use ruft::config::RuftConfig;
use ruft::payload::PayloadSink;
use ruft::receiver::Receiver;
use std::net::SocketAddr;
use std::path::PathBuf;
use anyhow::anyhow;
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    /// local address to listen on, e.g. 127.0.0.1:9000
    listen: String,

    /// where to store the received payload
    output: PathBuf,

    /// artificially drop this fraction of incoming datagrams (0.0 to 1.0)
    #[clap(long, default_value_t = 0.0)]
    loss_rate: f64,

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

    if !(0.0..=1.0).contains(&args.loss_rate) {
        return Err(anyhow!("loss rate must be between 0.0 and 1.0"));
    }

    let listen: SocketAddr = args.listen.parse()?;
    let config = RuftConfig::new();

    let socket = UdpChannel::bind(listen, config.max_datagram_size()).await?;
    info!("listening on {}", socket.local_addr()?);
    let channel = LossyChannel::new(socket, args.loss_rate);

    let mut sink = PayloadSink::file(&args.output).await?;
    let mut receiver = Receiver::accept(channel, config).await?;
    let stats = receiver.run(&mut sink).await?;

    info!(
        "stored {} bytes to {}, {} datagrams dropped by the loss shim",
        stats.bytes_delivered,
        args.output.display(),
        receiver.channel().dropped(),
    );
    Ok(())
}
