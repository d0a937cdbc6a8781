use airhook::config::AirhookConfig;
use airhook::data_handler::DataHandler;
use airhook::end_point::listen_airhook_stream;
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tracing::{info, Level};

/// Exchanges lines of text between two nodes: start one node per terminal, each with the other
///  one's address as peer, and type away
#[derive(Parser)]
struct Args {
    self_address: String,
    peer_address: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct PrintingDataHandler;

#[async_trait]
impl DataHandler for PrintingDataHandler {
    async fn on_data(&self, peer_addr: SocketAddr, data: Bytes) {
        print!("{}> {}", peer_addr, String::from_utf8_lossy(&data));
    }
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

    let peer_addr: SocketAddr = args.peer_address.parse()?;
    let config = Arc::new(AirhookConfig::default_for(args.self_address.parse()?));
    let end_point = Arc::new(listen_airhook_stream(config, Arc::new(PrintingDataHandler)).await?);
    info!("listening on {:?}, chatting with {:?}", end_point.self_addr()?, peer_addr);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let input_loop = async {
        while let Some(line) = lines.next_line().await? {
            end_point.write(peer_addr, Bytes::from(format!("{}\n", line))).await?;
        }
        anyhow::Ok(())
    };

    select! {
        _ = end_point.recv_loop() => Ok(()),
        _ = end_point.sweep_loop() => Ok(()),
        result = input_loop => result,
    }
}
