//! The phase machine driving one modem from power-up to a verified data
//! round trip and back.
//!
//! ```text
//! Created -> PoweredUp -> [AwaitingDevice] -> SessionEstablished -> [PinVerified]
//!   -> SignalChecked -> [MessageSent] -> DataModeActive -> IpAcquired
//!   -> TrafficProbeRunning -> TrafficConfirmed -> CommandModeRestored
//!   -> IdentityQueried -> Terminal
//! ```
//!
//! On a hot-plug transport every wait also watches for the device going away,
//! in which case the session is dropped and the machine goes back to
//! `AwaitingDevice`. Power sequencing and the network interface are not
//! redone.

use crate::{
    event_group::{Conditions, EventGroup},
    netif::NetworkInterface,
    observer,
    power::PowerSequencer,
    probe::TrafficProbe,
    session::{LinkMode, LinkSession, PinStatus},
    transport::Transport,
};
use color_eyre::eyre::Report;
use derive_more::Display;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tokio::{sync::watch, time};
use tracing::{debug, error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    PoweredUp,
    AwaitingDevice,
    SessionEstablished,
    PinVerified,
    SignalChecked,
    MessageSent,
    DataModeActive,
    IpAcquired,
    TrafficProbeRunning,
    TrafficConfirmed,
    CommandModeRestored,
    IdentityQueried,
    #[display("Terminal({_0})")]
    Terminal(Terminal),
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// Fixed-wire cycle completed and everything was torn down.
    Clean,
    /// Hot-plug session limit reached.
    Disconnected,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Clean,
    /// The device went away after `sessions` sessions and no more were
    /// allowed.
    Disconnected { sessions: u32 },
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    #[display("power line configuration")]
    PowerConfiguration,
    #[display("modem wake up")]
    WakeUp,
    #[display("session open")]
    OpenSession,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOp {
    #[display("SIM PIN entry")]
    SetPin,
    #[display("signal quality query")]
    SignalQuality,
    #[display("sms")]
    SendSms,
    #[display("switch to {_0} mode")]
    SetMode(LinkMode),
    #[display("identity query")]
    Identity,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("fatal setup error: {stage} failed")]
    FatalSetup {
        stage: SetupStage,
        #[source]
        source: BoxError,
    },
    #[error("command channel error: {op} failed")]
    CommandChannel {
        op: SessionOp,
        #[source]
        source: BoxError,
    },
    #[error("traffic probe failed to start")]
    Probe {
        #[source]
        source: BoxError,
    },
    #[error("timed out in {phase} after {after:?} waiting for {awaited:?}")]
    Timeout {
        phase: Phase,
        awaited: Conditions,
        after: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sms {
    pub recipient: String,
    pub text: String,
}

/// How a session cycle ended, short of an error.
enum End {
    /// Fixed wire: nothing left to do.
    Finished,
    DeviceGone,
}

pub struct Orchestrator {
    power: PowerSequencer,
    transport: Box<dyn Transport>,
    netif: Box<dyn NetworkInterface>,
    probe: Box<dyn TrafficProbe>,
    events: EventGroup,
    pin: Option<SecretString>,
    sms: Option<Sms>,
    ip_timeout: Option<Duration>,
    probe_timeout: Option<Duration>,
    pin_settle: Duration,
    max_sessions: Option<u32>,
    phase: watch::Sender<Phase>,
}

#[bon::bon]
impl Orchestrator {
    #[builder]
    pub fn new(
        power: PowerSequencer,
        transport: Box<dyn Transport>,
        netif: Box<dyn NetworkInterface>,
        probe: Box<dyn TrafficProbe>,
        events: EventGroup,
        pin: Option<SecretString>,
        sms: Option<Sms>,
        ip_timeout: Option<Duration>,
        probe_timeout: Option<Duration>,
        #[builder(default = Duration::from_millis(1000))] pin_settle: Duration,
        max_sessions: Option<u32>,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Created);

        Self {
            power,
            transport,
            netif,
            probe,
            events,
            pin,
            sms,
            ip_timeout,
            probe_timeout,
            pin_settle,
            max_sessions,
            phase,
        }
    }
}

impl Orchestrator {
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub async fn run(mut self) -> Result<Outcome, OrchestratorError> {
        let result = self.run_sessions().await;

        let terminal = match &result {
            Ok(Outcome::Clean) => Terminal::Clean,
            Ok(Outcome::Disconnected { .. }) => Terminal::Disconnected,
            Err(e) => {
                error!("run aborted: {e}");
                Terminal::Aborted
            }
        };
        self.enter(Phase::Terminal(terminal));

        result
    }

    async fn run_sessions(&mut self) -> Result<Outcome, OrchestratorError> {
        self.power
            .configure()
            .await
            .map_err(fatal(SetupStage::PowerConfiguration))?;
        self.power
            .wake_up()
            .await
            .map_err(fatal(SetupStage::WakeUp))?;
        self.enter(Phase::PoweredUp);

        let hot_plug = self.transport.monitors_disconnect();
        let mut sessions = 0;

        loop {
            if hot_plug {
                self.enter(Phase::AwaitingDevice);
            }

            let mut session = self
                .transport
                .open()
                .await
                .map_err(fatal(SetupStage::OpenSession))?;
            sessions += 1;

            // a disconnect from the previous session must not end this one
            self.events.clear(Conditions::DEVICE_DISCONNECTED);
            if hot_plug {
                session.on_terminal_error(observer::terminal_error_handler(
                    self.events.clone(),
                ));
            }
            self.enter(Phase::SessionEstablished);

            let end = self.drive(session.as_mut(), hot_plug).await;
            destroy(session).await;

            match end? {
                End::Finished => {
                    self.destroy_netif().await;
                    return Ok(Outcome::Clean);
                }
                End::DeviceGone => {
                    info!("modem disconnected, session {sessions} closed");
                    if self.max_sessions.is_some_and(|max| sessions >= max) {
                        self.destroy_netif().await;
                        return Ok(Outcome::Disconnected { sessions });
                    }
                }
            }
        }
    }

    async fn drive(
        &mut self,
        session: &mut dyn LinkSession,
        hot_plug: bool,
    ) -> Result<End, OrchestratorError> {
        let watched = if hot_plug {
            Conditions::DEVICE_DISCONNECTED
        } else {
            Conditions::empty()
        };

        self.unlock_sim(session).await?;

        let quality = session
            .signal_quality()
            .await
            .map_err(command(SessionOp::SignalQuality))?;
        info!("signal quality: {quality}");
        self.enter(Phase::SignalChecked);

        if let Some(Sms { recipient, text }) = &self.sms {
            session
                .send_sms(recipient, text)
                .await
                .map_err(command(SessionOp::SendSms))?;
            self.enter(Phase::MessageSent);
        }

        self.events.clear(Conditions::CONNECTED);
        session
            .set_mode(LinkMode::Data)
            .await
            .map_err(command(SessionOp::SetMode(LinkMode::Data)))?;
        self.enter(Phase::DataModeActive);
        // an address kept from the previous session would not show up as a change
        self.netif.resync();

        info!("waiting for IP address");
        let seen = self
            .wait(Conditions::CONNECTED | watched, self.ip_timeout)
            .await?;
        if seen.contains(Conditions::DEVICE_DISCONNECTED) {
            return Ok(End::DeviceGone);
        }
        self.enter(Phase::IpAcquired);

        self.events.clear(Conditions::GOT_DATA);
        self.probe
            .start(self.events.clone())
            .await
            .map_err(|report| OrchestratorError::Probe {
                source: report.into(),
            })?;
        self.enter(Phase::TrafficProbeRunning);

        let seen = match self
            .wait(Conditions::GOT_DATA | watched, self.probe_timeout)
            .await
        {
            Ok(seen) => seen,
            Err(e) => {
                self.stop_probe().await;
                return Err(e);
            }
        };
        if seen.contains(Conditions::DEVICE_DISCONNECTED) {
            self.stop_probe().await;
            return Ok(End::DeviceGone);
        }
        self.enter(Phase::TrafficConfirmed);
        self.log_stats().await;

        self.stop_probe().await;
        session
            .set_mode(LinkMode::Command)
            .await
            .map_err(command(SessionOp::SetMode(LinkMode::Command)))?;
        self.enter(Phase::CommandModeRestored);

        let imsi = session
            .imsi()
            .await
            .map_err(command(SessionOp::Identity))?;
        info!("IMSI={imsi}");
        self.enter(Phase::IdentityQueried);

        if !hot_plug {
            return Ok(End::Finished);
        }

        info!("cycle complete, unplug and replug the modem to run it again");
        self.wait(watched, None).await?;

        Ok(End::DeviceGone)
    }

    async fn unlock_sim(&mut self, session: &mut dyn LinkSession) -> Result<(), OrchestratorError> {
        match session.read_pin_status().await {
            Ok(PinStatus::Ready) => {
                debug!("SIM PIN not required");
                Ok(())
            }
            Ok(PinStatus::Required) => {
                let Some(pin) = &self.pin else {
                    return Err(OrchestratorError::CommandChannel {
                        op: SessionOp::SetPin,
                        source: "SIM requires a PIN but none is configured".into(),
                    });
                };

                session
                    .set_pin(pin.expose_secret())
                    .await
                    .map_err(command(SessionOp::SetPin))?;
                // the modem needs a moment before it accepts further commands
                time::sleep(self.pin_settle).await;
                self.enter(Phase::PinVerified);

                Ok(())
            }
            Err(e) => {
                warn!("failed to read SIM PIN status, continuing: {e}");
                Ok(())
            }
        }
    }

    /// Empty result only on timeout, which becomes an error.
    async fn wait(
        &self,
        awaited: Conditions,
        timeout: Option<Duration>,
    ) -> Result<Conditions, OrchestratorError> {
        let seen = self.events.wait_any(awaited, timeout).await;
        if seen.is_empty() {
            return Err(OrchestratorError::Timeout {
                phase: self.phase(),
                awaited,
                after: timeout.unwrap_or_default(),
            });
        }

        debug!("observed {seen:?}");
        Ok(seen)
    }

    async fn stop_probe(&mut self) {
        if let Err(e) = self.probe.stop().await {
            warn!("failed to stop traffic probe: {e}");
        }
    }

    async fn log_stats(&self) {
        match self.netif.stats().await {
            Ok(stats) => info!(
                "{}: tx {} bytes, rx {} bytes",
                self.netif.name(),
                stats.tx_bytes,
                stats.rx_bytes
            ),
            Err(e) => debug!("no stats for {}: {e}", self.netif.name()),
        }
    }

    async fn destroy_netif(&mut self) {
        if let Err(e) = self.netif.destroy().await {
            warn!("failed to destroy {}: {e}", self.netif.name());
        }
    }

    fn enter(&self, next: Phase) {
        let prev = self.phase.send_replace(next);
        info!("phase {prev} -> {next}");
    }
}

/// Consumes the session so it cannot be destroyed twice.
async fn destroy(mut session: Box<dyn LinkSession>) {
    if let Err(e) = session.destroy().await {
        warn!("failed to destroy session: {e}");
    }
}

fn fatal(stage: SetupStage) -> impl FnOnce(Report) -> OrchestratorError {
    move |report| OrchestratorError::FatalSetup {
        stage,
        source: report.into(),
    }
}

fn command(op: SessionOp) -> impl FnOnce(Report) -> OrchestratorError {
    move |report| OrchestratorError::CommandChannel {
        op,
        source: report.into(),
    }
}
