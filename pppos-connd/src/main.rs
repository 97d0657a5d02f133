use clap::Parser;
use color_eyre::eyre::Result;
use pppos_connd::config::{Cli, Config};
use tokio::signal::unix::{self, SignalKind};
use tracing::warn;

const SYSLOG_IDENTIFIER: &str = "pppos-connd";

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let tel_flusher = pppos_telemetry::TelemetryConfig::new()
        .with_journald(SYSLOG_IDENTIFIER)
        .with_quiet_target("rumqttc")
        .init();

    let result = async {
        let config = Config::from_cli(&cli);

        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let mut sigint = unix::signal(SignalKind::interrupt())?;

        tokio::select! {
            outcome = pppos_connd::program().config(config).sysfs("/sys").run() => {
                outcome.map(|_| ())
            }
            _ = sigterm.recv() => {
                warn!("received SIGTERM");
                Ok(())
            }
            _ = sigint.recv() => {
                warn!("received SIGINT");
                Ok(())
            }
        }
    }
    .await;

    tel_flusher.flush();

    result
}
