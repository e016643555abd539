// geomesh CLI - wire up transports and exchange messages from the shell

use clap::{Parser, Subcommand};
use geomesh::message::{Payload, TransportMessage};
use geomesh::transport::{
    LanTransport, LanTransportConfig, StationTransport, StationTransportConfig, Transport,
    TransportConfig, TransportRouter, TungsteniteRelaySocket,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "geomesh", about = "Offline-first multi-transport messaging")]
struct Cli {
    /// Own callsign
    #[arg(long)]
    callsign: String,

    /// Station relay base URL
    #[arg(long)]
    station_url: Option<String>,

    /// Relay WebSocket URL; defaults to none (HTTP-only relay use)
    #[arg(long)]
    station_ws_url: Option<String>,

    /// LAN peer as CALLSIGN=URL, repeatable
    #[arg(long = "lan-peer")]
    lan_peers: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe which transport reaches a peer
    Reach {
        #[arg(long)]
        target: String,
    },
    /// Send a liveness ping
    Ping {
        #[arg(long)]
        target: String,
    },
    /// Send an API request
    Api {
        #[arg(long)]
        target: String,
        #[arg(long, default_value = "GET")]
        method: String,
        #[arg(long)]
        path: String,
        #[arg(long)]
        body: Option<String>,
    },
    /// Print inbound messages as they arrive
    Listen,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = TransportConfig::default();
    let router = TransportRouter::new(&config);

    let lan = Arc::new(LanTransport::new(LanTransportConfig::new(&cli.callsign)));
    for peer in &cli.lan_peers {
        let (callsign, url) = peer
            .split_once('=')
            .ok_or("lan-peer must be CALLSIGN=URL")?;
        lan.register_device(callsign, url).await?;
    }
    router.register(lan.clone()).await;

    if let Some(station_url) = &cli.station_url {
        // The relay serves its WebSocket next to the HTTP endpoint unless
        // told otherwise.
        let ws_url = cli.station_ws_url.clone().unwrap_or_else(|| {
            format!("{}/ws", station_url.replacen("http", "ws", 1))
        });
        let station = Arc::new(StationTransport::new(
            StationTransportConfig::new(&cli.callsign, station_url),
            Arc::new(TungsteniteRelaySocket::new(&ws_url)),
            router.inbound_sender(),
        ));
        router.register(station).await;
    }

    router.initialize_all().await?;

    match cli.command {
        Command::Reach { target } => {
            let transports = [lan.clone() as Arc<dyn Transport>];
            for transport in transports {
                let reachable = transport.can_reach(&target).await;
                let quality = transport.quality(&target).await;
                println!("{}: reachable={} quality={}", transport.id(), reachable, quality);
            }
        }
        Command::Ping { target } => {
            let result = router.send(TransportMessage::ping(&target), None).await;
            print_result(&result);
        }
        Command::Api {
            target,
            method,
            path,
            body,
        } => {
            let mut message = TransportMessage::api_request(&target, &method, &path);
            if let Some(body) = body {
                let payload = serde_json::from_str(&body)
                    .map(Payload::Json)
                    .unwrap_or(Payload::Text(body));
                message = message.with_payload(payload);
            }
            let result = router.send(message, None).await;
            print_result(&result);
        }
        Command::Listen => {
            let mut inbound = router
                .take_inbound()
                .await
                .ok_or("inbound stream already taken")?;
            info!("listening for inbound messages, ctrl-c to stop");
            while let Some(message) = inbound.recv().await {
                println!(
                    "[{}] {} from {}",
                    message.source_transport_id().unwrap_or("?"),
                    message.message_type(),
                    message.target_callsign()
                );
            }
        }
    }

    router.dispose_all().await;
    Ok(())
}

fn print_result(result: &geomesh::message::TransportResult) {
    if result.success() {
        println!(
            "delivered via {} status={:?} latency={:?}",
            result.transport_used(),
            result.status_code(),
            result.latency()
        );
        if let Some(data) = result.response_data() {
            println!("{}", data);
        }
    } else {
        println!(
            "failed via {}: {}",
            result.transport_used(),
            result.error().unwrap_or("unknown")
        );
    }
}
