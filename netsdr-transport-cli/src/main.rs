//! NetSDR transport diagnostic tool.
//!
//! Talks to a receiver through the same transports the client application uses, printing every
//! inbound message as hex.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use eyre::WrapErr;
use netsdr_transport_std::{
    DatagramTransportClient, DatagramTransportConfig, RemoteAddress, StreamTransportClient,
    StreamTransportConfig,
};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
#[command(version, about)]
struct Arguments {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect over TCP, send the given payloads and print everything received.
    Stream(StreamArguments),

    /// Listen for UDP datagrams and print each one with its source.
    Listen(ListenArguments),
}

#[derive(Args)]
struct StreamArguments {
    /// Remote `host:port` of the receiver.
    #[arg(env = "NETSDR_REMOTE")]
    remote: RemoteAddress,

    /// Payload to send, hex encoded. May be repeated.
    #[arg(long)]
    send_hex: Vec<HexPayload>,

    /// Payload to send as UTF-8 text, after the hex payloads. May be repeated.
    #[arg(long)]
    send_text: Vec<String>,

    /// Give up connecting after this many milliseconds.
    #[arg(long, value_name = "MILLISECONDS")]
    connect_timeout_ms: Option<u64>,

    /// Disconnect after this many milliseconds instead of waiting for Ctrl-C.
    #[arg(long, value_name = "MILLISECONDS")]
    duration_ms: Option<u64>,
}

#[derive(Args)]
struct ListenArguments {
    /// Local UDP port to listen on.
    #[arg(env = "NETSDR_UDP_PORT")]
    port: u16,

    /// Kernel receive buffer size in bytes.
    #[arg(long)]
    receive_buffer_size: Option<usize>,

    /// Stop after this many milliseconds instead of waiting for Ctrl-C.
    #[arg(long, value_name = "MILLISECONDS")]
    duration_ms: Option<u64>,
}

/// A payload given on the command line as hex.
#[derive(Clone, Debug)]
struct HexPayload(Vec<u8>);

impl FromStr for HexPayload {
    type Err = hex::FromHexError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        let digits: String = string
            .chars()
            .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
            .collect();
        hex::decode(digits).map(HexPayload)
    }
}

// How often to check whether the peer has gone away while idle.
const LIVENESS_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Arguments::parse();

    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .with_env_var("NETSDR_LOG")
                    .from_env()?,
            )
            .with_writer(std::io::stderr)
            .compact()
            .finish(),
    )?;

    match args.command {
        Command::Stream(arguments) => run_stream(arguments).await,
        Command::Listen(arguments) => run_listen(arguments).await,
    }
}

/// Resolves after `duration`, or on Ctrl-C when no duration is given.
async fn finished(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(?error, "failed to wait for Ctrl-C");
            }
        }
    }
}

async fn run_stream(arguments: StreamArguments) -> eyre::Result<()> {
    let mut config = StreamTransportConfig::new(arguments.remote);
    if let Some(timeout) = arguments.connect_timeout_ms {
        config = config.with_connect_timeout(Duration::from_millis(timeout));
    }

    let (mut client, mut inbound) = StreamTransportClient::with_config(config);
    client
        .connect()
        .await
        .wrap_err_with(|| format!("connecting to {}", client.remote()))?;

    for HexPayload(payload) in &arguments.send_hex {
        client.send(payload).await.wrap_err("sending hex")?;
    }
    for text in &arguments.send_text {
        client.send_str(text).await.wrap_err("sending text")?;
    }

    let finished = finished(arguments.duration_ms.map(Duration::from_millis));
    tokio::pin!(finished);
    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut finished => break,
            message = inbound.next() => {
                let Some(message) = message else { break };
                println!("{}", hex::encode_upper(&message));
            }
            _ = liveness.tick() => {
                if !client.is_connected() {
                    tracing::info!("connection lost");
                    break;
                }
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

async fn run_listen(arguments: ListenArguments) -> eyre::Result<()> {
    let mut config = DatagramTransportConfig::new(arguments.port);
    if let Some(size) = arguments.receive_buffer_size {
        config = config.with_receive_buffer_size(size);
    }

    let (mut client, mut inbound) = DatagramTransportClient::with_config(config);
    client
        .start_listening()
        .await
        .wrap_err_with(|| format!("listening on {}", client.local_endpoint()))?;

    let finished = finished(arguments.duration_ms.map(Duration::from_millis));
    tokio::pin!(finished);

    loop {
        tokio::select! {
            _ = &mut finished => break,
            datagram = inbound.next() => {
                let Some(datagram) = datagram else { break };
                println!("{} {}", datagram.source, hex::encode_upper(&datagram.payload));
            }
        }
    }

    client.stop_listening().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::{Arguments, Command, HexPayload};

    #[test]
    fn verify_cli() {
        Arguments::command().debug_assert();
    }

    #[test]
    fn hex_payload_accepts_separators() {
        let HexPayload(bytes) = "04 20:01-00".parse().unwrap();
        assert_eq!(bytes, [0x04, 0x20, 0x01, 0x00]);
        assert!("0g".parse::<HexPayload>().is_err());
        assert!("123".parse::<HexPayload>().is_err());
    }

    #[test]
    fn stream_arguments() {
        let args = Arguments::try_parse_from([
            "netsdr-transport",
            "stream",
            "127.0.0.1:50000",
            "--send-hex",
            "DEADBEEF",
            "--send-text",
            "ping",
            "--duration-ms",
            "100",
        ])
        .unwrap();

        let Command::Stream(stream) = args.command else {
            panic!("expected the stream command");
        };
        assert_eq!(stream.remote.port(), 50000);
        assert_eq!(stream.send_hex.len(), 1);
        assert_eq!(stream.send_hex[0].0, [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(stream.send_text, ["ping"]);
        assert_eq!(stream.duration_ms, Some(100));
    }

    #[test]
    fn listen_arguments() {
        let args = Arguments::try_parse_from(["netsdr-transport", "listen", "50001"])
            .unwrap();

        let Command::Listen(listen) = args.command else {
            panic!("expected the listen command");
        };
        assert_eq!(listen.port, 50001);
        assert_eq!(listen.receive_buffer_size, None);
    }
}
