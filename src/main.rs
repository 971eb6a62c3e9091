//! ntpmon - NTP daemon monitor
//!
//! `ntpmon check` prints a Nagios status line for the local chronyd or ntpd.
//! `ntpmon monitor` reports the same metrics, plus per-peer measurements,
//! to collectd, telegraf or a prometheus exporter.

mod alert;
mod check;
mod classifier;
mod config;
mod measurements;
mod metrics;
mod output;
mod peers;
mod probe;
mod scheduler;
mod tailer;
mod web;

use std::io::IsTerminal;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use classifier::Severity;
use config::{CheckConfig, Cli, Command, MonitorConfig};
use output::{CollectdOutput, Mode, Output, PrometheusOutput, SharedRegistry, TelegrafOutput};
use scheduler::Scheduler;
use web::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    // stdout carries check results and collectd values, so logs go to stderr
    let directive = match cli.command {
        Command::Check(_) => "ntpmon=warn",
        Command::Monitor(_) => "ntpmon=info",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    match cli.command {
        Command::Check(args) => {
            let cfg = CheckConfig::from(args);
            let code = match check::run(&cfg).await {
                Ok(code) => code,
                Err(e) => {
                    println!("{}: {}", Severity::Unknown, e);
                    Severity::Unknown.rank()
                }
            };
            std::process::exit(code);
        }
        Command::Monitor(args) => {
            let cfg = MonitorConfig::load(args)?;
            tracing::info!("Starting ntpmon in {:?} mode", cfg.mode);

            let mut server = None;
            let output = match cfg.mode {
                Mode::Collectd => Output::Collectd(CollectdOutput::new(&cfg.hostname, cfg.interval)),
                Mode::Telegraf if std::io::stdout().is_terminal() => {
                    Output::Telegraf(TelegrafOutput::stdout())
                }
                Mode::Telegraf => Output::Telegraf(TelegrafOutput::connect(&cfg.connect).await?),
                Mode::Prometheus => {
                    let registry = SharedRegistry::default();
                    server = Some(Server::new(cfg.listen, registry.clone()));
                    Output::Prometheus(PrometheusOutput::new(registry))
                }
            };

            let scheduler = Scheduler::new(cfg, output)?;
            match server {
                Some(server) => {
                    tokio::select! {
                        result = server.start() => result?,
                        result = scheduler.run() => result?,
                    }
                }
                None => scheduler.run().await?,
            }
        }
    }

    Ok(())
}
