//! Command runners behind the `lanshare` binary.

pub mod args;
pub mod peer;

use crate::core::relay::{server, Relay};
use crate::utils::sos::SignalOfStop;
use anyhow::Result;
use args::{Args, Command, ServeArgs};
use clap::CommandFactory;
use std::sync::Arc;

pub async fn run(args: Args, sos: SignalOfStop) -> Result<()> {
    match args.command.clone() {
        Some(Command::Serve(serve)) => run_relay(&serve, sos).await,
        Some(Command::Send(send)) => peer::send(&args, &send, sos).await,
        Some(Command::Receive(receive)) => peer::receive(&args, &receive, sos).await,
        None => {
            Args::command().print_help()?;
            Ok(())
        }
    }
}

async fn run_relay(serve: &ServeArgs, sos: SignalOfStop) -> Result<()> {
    let config = serve.relay_config()?;
    let relay = Arc::new(Relay::new(config));
    server::serve(relay, sos).await
}
