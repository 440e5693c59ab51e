//! Client side of the CLI: join the relay as a peer and send or receive.

use super::args::{Args, ReceiveArgs, SendArgs};
use crate::core::config::TransferConfig;
use crate::core::connection::WebRtcConnector;
use crate::core::engine::{
    AlwaysResume, ArtifactSink, DirectorySink, Engine, EngineOptions, NeverResume, ResumePolicy,
};
use crate::core::events::{FileRequestEvent, TransferOutcome};
use crate::core::persistence::SessionStore;
use crate::core::session::now_ms;
use crate::core::signaling;
use crate::utils::data_dir;
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const STORE_DIR: &str = "transfers";

struct Peer {
    engine: Arc<Engine>,
    runner: JoinHandle<()>,
    nickname: String,
}

async fn join(
    args: &Args,
    sink: Arc<dyn ArtifactSink>,
    auto_accept: bool,
    sos: SignalOfStop,
) -> Result<Peer> {
    let data_dir = data_dir::resolve(args.data_dir.as_deref())?;
    let mut store = SessionStore::new(data_dir.join(STORE_DIR));
    if !args.no_resume {
        match store.load(now_ms()) {
            Ok(restored) => info!(event = "sessions_loaded", restored, dir = %store.root().display()),
            Err(e) => warn!(event = "sessions_unavailable", error = %e),
        }
    }

    let nickname = args.nickname();
    let session = signaling::connect(args.relay_url(), &nickname, sos.clone())
        .await
        .with_context(|| format!("cannot join relay {}", args.relay_url()))?;

    let options = EngineOptions {
        transfer: TransferConfig {
            chunk_size: args.chunk_size(),
            ..TransferConfig::default()
        },
        auto_accept,
        resume_enabled: !args.no_resume,
        ..EngineOptions::default()
    };
    let resume: Arc<dyn ResumePolicy> = if args.no_resume {
        Arc::new(NeverResume)
    } else {
        Arc::new(AlwaysResume)
    };
    let (engine, links) = Engine::new(
        session.outbound,
        Arc::new(WebRtcConnector),
        store,
        sink,
        resume,
        options,
    );
    let runner = tokio::spawn(engine.clone().run(session.inbound, links, sos));
    Ok(Peer {
        engine,
        runner,
        nickname,
    })
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Print progress in whole-percent steps.
fn report_progress(engine: &Engine) {
    let last = Arc::new(AtomicU32::new(u32::MAX));
    engine.events().transfer_progress.subscribe(move |p| {
        let pct = (p.progress * 100.0).floor() as u32;
        if last.swap(pct, Ordering::Relaxed) != pct {
            eprint!("\r{}: {pct:>3}%", p.file_name);
            if pct >= 100 {
                eprintln!();
            }
        }
    });
    engine.events().transfer_log.subscribe(|log| {
        let verdict = match log.outcome {
            TransferOutcome::Completed => "done",
            TransferOutcome::Failed => "failed",
            TransferOutcome::Rejected => "rejected",
        };
        match &log.error {
            Some(err) => eprintln!("{} ({}) {verdict}: {err}", log.file_name, human_size(log.file_size)),
            None => eprintln!("{} ({}) {verdict}", log.file_name, human_size(log.file_size)),
        }
    });
}

pub async fn send(args: &Args, send: &SendArgs, sos: SignalOfStop) -> Result<()> {
    let sink = Arc::new(DirectorySink::new(std::env::temp_dir()));
    let peer = join(args, sink, false, sos.clone()).await?;
    report_progress(&peer.engine);

    let target = peer
        .engine
        .wait_for_peer(&send.to, Duration::from_secs(send.wait_secs))
        .await
        .ok_or_else(|| anyhow!("device '{}' did not appear on the relay", send.to))?;
    info!(event = "target_found", device = %target.id, name = %target.name);

    let results = match sos.select(peer.engine.send_queue(&send.files, &target.id)).await {
        Some(results) => results,
        None => return Err(anyhow!("interrupted")),
    };
    sos.cancel();
    let _ = peer.runner.await;

    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    if failed > 0 {
        return Err(anyhow!("{failed} of {} files failed", results.len()));
    }
    Ok(())
}

async fn ask(lines: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>, offer: &FileRequestEvent, from: &str) -> bool {
    eprint!(
        "Accept '{}' ({}) from {from}? [y/N] ",
        offer.file_name,
        human_size(offer.file_size)
    );
    matches!(
        lines.next_line().await,
        Ok(Some(answer)) if answer.trim().eq_ignore_ascii_case("y") || answer.trim().eq_ignore_ascii_case("yes")
    )
}

pub async fn receive(args: &Args, receive: &ReceiveArgs, sos: SignalOfStop) -> Result<()> {
    let sink = Arc::new(DirectorySink::new(&receive.out_dir));
    let mut peer = join(args, sink, receive.auto_accept, sos.clone()).await?;
    report_progress(&peer.engine);
    eprintln!(
        "Waiting for files as '{}' (saving to {})",
        peer.nickname,
        receive.out_dir.display()
    );

    let (tx, mut requests) = mpsc::unbounded_channel();
    peer.engine.events().file_request.subscribe(move |offer| {
        let _ = tx.send(offer.clone());
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = sos.wait() => break,
            _ = &mut peer.runner => {
                warn!(event = "relay_session_ended");
                return Err(anyhow!("relay connection lost"));
            }
            Some(offer) = requests.recv() => {
                let from = peer
                    .engine
                    .find_peer(&offer.source_device)
                    .map(|d| d.name)
                    .unwrap_or_else(|| offer.source_device.clone());
                if receive.auto_accept {
                    eprintln!("Receiving '{}' from {from}", offer.file_name);
                    continue;
                }
                if ask(&mut lines, &offer, &from).await {
                    peer.engine.accept_incoming(&offer.source_device);
                } else {
                    peer.engine.reject_incoming(&offer.source_device);
                }
            }
        }
    }
    let _ = peer.runner.await;
    Ok(())
}
