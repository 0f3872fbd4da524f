use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use transport_mux::{pipe, MuxConfig, Negotiator, Peer, VirtualLan};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
}

#[derive(Debug, Parser)]
#[command(
    name = "mux-loopback",
    version,
    about = "Negotiates a connection over an in-memory pipe, then nests connections through its control channel"
)]
struct Cli {
    /// Number of connections to nest inside the outer one.
    #[arg(long, env = "MUX_LOOPBACK_DEPTH", default_value_t = 2)]
    depth: usize,

    /// Label prefix for nested offers.
    #[arg(long, default_value = "nested")]
    label: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter_layer);
    match format {
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = MuxConfig::from_env();
    info!(
        depth = cli.depth,
        control_label = %config.control_label,
        inbox_depth = config.inbox_depth,
        "starting mux-loopback"
    );
    let negotiator = Negotiator::new(config);
    let lan = Arc::new(
        VirtualLan::new(2 * (cli.depth + 1))
            .await
            .context("build virtual network")?,
    );

    let (mut offerer, mut answerer) = connect_direct(&lan, &negotiator)
        .await
        .context("negotiate outer connection")?;
    info!(level = 0, "outer connection established");
    let mut offerers = vec![offerer.clone()];

    for level in 1..=cli.depth {
        let label = format!("{}-{level}", cli.label);
        let (next_offerer, next_answerer) = nest(&lan, &negotiator, &offerer, &answerer, &label)
            .await
            .with_context(|| format!("negotiate nested connection {label}"))?;
        info!(level, %label, "nested connection established");
        offerers.push(next_offerer.clone());
        offerer = next_offerer;
        answerer = next_answerer;
    }

    for (level, peer) in offerers.iter().enumerate().rev() {
        peer.close()
            .await
            .with_context(|| format!("close connection at level {level}"))?;
        wait_closed(peer)
            .await
            .with_context(|| format!("connection at level {level} did not close"))?;
        info!(level, "connection closed");
    }
    drop(answerer);

    lan.shutdown().await.context("stop virtual network")?;
    Ok(())
}

async fn connect_direct(lan: &VirtualLan, negotiator: &Negotiator) -> Result<(Peer, Peer)> {
    let (offer_end, answer_end) = pipe();
    let offer_pc = lan.peer_connection().await?;
    let answer_pc = lan.peer_connection().await?;
    let (offerer, answerer) = tokio::try_join!(
        negotiator.offer(offer_pc, offer_end),
        negotiator.answer(answer_pc, answer_end),
    )?;
    Ok((offerer, answerer))
}

async fn nest(
    lan: &Arc<VirtualLan>,
    negotiator: &Negotiator,
    offerer: &Peer,
    answerer: &Peer,
    label: &str,
) -> Result<(Peer, Peer)> {
    let (answered_tx, answered_rx) = oneshot::channel::<Result<Peer>>();
    let answered_tx = Mutex::new(Some(answered_tx));
    let answer_lan = Arc::clone(lan);
    let answer_negotiator = negotiator.clone();
    answerer.set_on_inbound_offer(move |label, channel| {
        let sender = match answered_tx.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            warn!(%label, "ignoring unexpected nested offer");
            return;
        };
        let lan = Arc::clone(&answer_lan);
        let negotiator = answer_negotiator.clone();
        tokio::spawn(async move {
            let result: Result<Peer> = async {
                let connection = lan.peer_connection().await?;
                Ok(negotiator.answer(connection, channel).await?)
            }
            .await;
            let _ = sender.send(result);
        });
    });

    let offering = async {
        let connection = lan.peer_connection().await?;
        Ok::<_, anyhow::Error>(offerer.offer(connection, label).await?)
    };
    let answering = async { answered_rx.await.context("answering task ended early")? };
    let (nested_offerer, nested_answerer) = tokio::try_join!(offering, answering)?;
    Ok((nested_offerer, nested_answerer))
}

async fn wait_closed(peer: &Peer) -> Result<()> {
    timeout(CLOSE_TIMEOUT, async {
        while peer.connection_state() != RTCPeerConnectionState::Closed {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("timed out")
}
