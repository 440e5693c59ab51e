use lanshare::utils::sos::SignalOfStop;
use lanshare::workers::{self, args::Args};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    // webrtc_ice reports every late STUN response; keep it at error.
    let filter = match args.verbose {
        0 => "warn,lanshare=info,webrtc_ice=error",
        1 => "info,webrtc_ice=error",
        2 => "debug,webrtc_ice=error",
        _ => "trace,webrtc_ice=error",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    workers::run(args, sos).await
}
