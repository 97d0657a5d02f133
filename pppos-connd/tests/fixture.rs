#![allow(dead_code)]
use async_trait::async_trait;
use bon::bon;
use color_eyre::{eyre::eyre, Result};
use mockall::mock;
use pppos_connd::{
    event_group::{Conditions, EventGroup},
    netif::{stats::NetStats, NetworkInterface},
    observer,
    orchestrator::{Orchestrator, OrchestratorError, Outcome, Phase, Sms},
    power::{Level, Line, PowerControl, PowerSequencer, PowerTimings},
    probe::TrafficProbe,
    session::{LinkMode, LinkSession, PinStatus, SignalQuality, TerminalErrorHandler},
    transport::Transport,
};
use pppos_connd_events::{IpEvent, Ipv4Info, PppEvent, TerminalError};
use secrecy::SecretString;
use std::{
    collections::VecDeque,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::JoinHandle;

pub const PIN: &str = "1234";
pub const IMSI: &str = "901288001234567";

/// Every call the orchestrator makes on the fakes, in order.
#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<String>>>);

impl Calls {
    pub fn push(&self, call: &str) {
        self.0.lock().unwrap().push(call.to_string());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|c| *c == call).count()
    }
}

/// When the device gets pulled during a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unplug {
    /// Right after the switch to data mode, before an address shows up.
    InDataMode,
    /// While the identity is being queried.
    AtIdentity,
    /// After the broker round trip has started.
    DuringRoundTrip,
}

type HandlerSlot = Arc<Mutex<Option<TerminalErrorHandler>>>;

pub struct Fixture {
    pub events: EventGroup,
    pub calls: Calls,
    ip_tx: flume::Sender<IpEvent>,
    // fired by the fake round trip
    round_trip_unplug: HandlerSlot,
    _ppp_tx: flume::Sender<PppEvent>,
    observer: JoinHandle<Result<()>>,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.observer.abort();
    }
}

pub struct Run {
    pub result: Result<Outcome, OrchestratorError>,
    pub final_phase: Phase,
}

#[bon]
impl Fixture {
    pub fn new() -> Self {
        let _ = color_eyre::install();

        let (ip_tx, ip_rx) = flume::unbounded();
        let (ppp_tx, ppp_rx) = flume::unbounded();
        let events = EventGroup::new();
        let observer = observer::spawn(ip_rx, ppp_rx, events.clone());

        Self {
            events,
            calls: Calls::default(),
            ip_tx,
            round_trip_unplug: Default::default(),
            _ppp_tx: ppp_tx,
            observer,
        }
    }

    /// A session on a modem that answers every command.
    #[builder(finish_fn = build)]
    pub fn session(
        &self,
        #[builder(default = PinStatus::Ready)] pin_status: PinStatus,
        #[builder(default = true)] pin_accepted: bool,
        #[builder(default = true)] gets_ip: bool,
        #[builder(default)] signal_fails: bool,
        mode_fails: Option<LinkMode>,
        #[builder(default)] imsi_fails: bool,
        unplug: Option<Unplug>,
    ) -> MockSession {
        let mut session = MockSession::new();
        let handler: HandlerSlot = Default::default();
        let unplug_now = {
            let handler = handler.clone();
            move || {
                if let Some(handler) = handler.lock().unwrap().as_ref() {
                    handler(TerminalError::DeviceGone);
                }
            }
        };

        let calls = self.calls.clone();
        let round_trip_unplug = self.round_trip_unplug.clone();
        session.expect_on_terminal_error().returning(move |h| {
            calls.push("on_terminal_error");
            if unplug == Some(Unplug::DuringRoundTrip) {
                *round_trip_unplug.lock().unwrap() = Some(h.clone());
            }
            *handler.lock().unwrap() = Some(h);
        });

        let calls = self.calls.clone();
        session.expect_read_pin_status().returning(move || {
            calls.push("read_pin_status");
            Ok(pin_status)
        });

        let calls = self.calls.clone();
        session
            .expect_set_pin()
            .withf(|pin| pin.to_string() == PIN)
            .returning(move |_| {
                calls.push("set_pin");
                if pin_accepted {
                    Ok(())
                } else {
                    Err(eyre!("+CME ERROR: incorrect password"))
                }
            });

        let calls = self.calls.clone();
        session.expect_signal_quality().returning(move || {
            calls.push("signal_quality");
            if signal_fails {
                return Err(eyre!("+CSQ: timeout"));
            }
            Ok(SignalQuality {
                rssi: Some(-69.0),
                ber: None,
            })
        });

        let calls = self.calls.clone();
        session.expect_send_sms().returning(move |_, _| {
            calls.push("send_sms");
            Ok(())
        });

        let calls = self.calls.clone();
        let ip_tx = self.ip_tx.clone();
        let unplug_in_data = unplug_now.clone();
        session.expect_set_mode().returning(move |mode| {
            calls.push(&format!("set_mode({mode})"));
            if mode_fails == Some(mode) {
                return Err(eyre!("NO CARRIER"));
            }
            if mode == LinkMode::Data {
                if unplug == Some(Unplug::InDataMode) {
                    unplug_in_data();
                } else if gets_ip {
                    ip_tx.send(got_ip()).unwrap();
                }
            }
            Ok(())
        });

        let calls = self.calls.clone();
        session.expect_imsi().returning(move || {
            calls.push("imsi");
            if imsi_fails {
                return Err(eyre!("+CME ERROR: SIM busy"));
            }
            if unplug == Some(Unplug::AtIdentity) {
                unplug_now();
            }
            Ok(IMSI.to_string())
        });

        let calls = self.calls.clone();
        session.expect_destroy().returning(move || {
            calls.push("destroy");
            Ok(())
        });

        session
    }

    #[builder(finish_fn = run)]
    pub async fn orchestrate(
        &self,
        sessions: Vec<MockSession>,
        #[builder(default)] hot_plug: bool,
        // whether the broker sends our own message back
        #[builder(default = true)] echo: bool,
        #[builder(default)] power_fails: bool,
        // the interface still holds the address from an earlier session
        #[builder(default)] address_kept: bool,
        pin: Option<&'static str>,
        sms: Option<Sms>,
        ip_timeout: Option<Duration>,
        probe_timeout: Option<Duration>,
        max_sessions: Option<u32>,
        pin_settle: Option<Duration>,
    ) -> Run {
        let transport = FakeTransport {
            sessions: Mutex::new(
                sessions
                    .into_iter()
                    .map(|s| Box::new(s) as Box<dyn LinkSession>)
                    .collect(),
            ),
            hot_plug,
            calls: self.calls.clone(),
        };

        let orchestrator = Orchestrator::builder()
            .power(PowerSequencer::new(mock_power(power_fails), PowerTimings::default()))
            .transport(Box::new(transport))
            .netif(Box::new(FakeNetif {
                address_kept,
                ip_tx: self.ip_tx.clone(),
                calls: self.calls.clone(),
            }))
            .probe(Box::new(FakeProbe {
                echo,
                unplug: self.round_trip_unplug.clone(),
                calls: self.calls.clone(),
            }))
            .events(self.events.clone())
            .maybe_pin(pin.map(|p| SecretString::new(p.to_string())))
            .maybe_sms(sms)
            .maybe_ip_timeout(ip_timeout)
            .maybe_probe_timeout(probe_timeout)
            .maybe_max_sessions(max_sessions)
            .maybe_pin_settle(pin_settle)
            .build();

        let phases = orchestrator.subscribe();
        let result = orchestrator.run().await;
        let final_phase = *phases.borrow();

        Run {
            result,
            final_phase,
        }
    }
}

pub fn got_ip() -> IpEvent {
    IpEvent::GotIp(Ipv4Info {
        netif: "ppp0".to_string(),
        ip: Ipv4Addr::new(10, 0, 0, 5),
        netmask: Ipv4Addr::new(255, 255, 255, 255),
        gateway: Ipv4Addr::new(10, 64, 64, 64),
        dns_primary: Some(Ipv4Addr::new(10, 74, 210, 210)),
        dns_secondary: None,
    })
}

fn mock_power(fails: bool) -> MockPower {
    let mut power = MockPower::new();

    power.expect_configure().returning(move || {
        if fails {
            Err(eyre!("gpio21: permission denied"))
        } else {
            Ok(())
        }
    });
    power.expect_set_line().returning(|_, _| Ok(()));

    power
}

struct FakeTransport {
    sessions: Mutex<VecDeque<Box<dyn LinkSession>>>,
    hot_plug: bool,
    calls: Calls,
}

#[async_trait]
impl Transport for FakeTransport {
    fn monitors_disconnect(&self) -> bool {
        self.hot_plug
    }

    async fn open(&mut self) -> Result<Box<dyn LinkSession>> {
        self.calls.push("open");
        self.sessions
            .get_mut()
            .unwrap()
            .pop_front()
            .ok_or_else(|| eyre!("no modem found"))
    }
}

struct FakeNetif {
    address_kept: bool,
    ip_tx: flume::Sender<IpEvent>,
    calls: Calls,
}

#[async_trait]
impl NetworkInterface for FakeNetif {
    fn name(&self) -> &str {
        "ppp0"
    }

    async fn stats(&self) -> Result<NetStats> {
        Ok(NetStats {
            tx_bytes: 1337,
            rx_bytes: 42,
        })
    }

    fn resync(&self) {
        self.calls.push("netif.resync");
        if self.address_kept {
            self.ip_tx.send(got_ip()).unwrap();
        }
    }

    async fn destroy(&mut self) -> Result<()> {
        self.calls.push("netif.destroy");
        Ok(())
    }
}

/// Stands in for a broker round trip: the message comes back as soon as the
/// probe starts, if `echo` is set.
struct FakeProbe {
    echo: bool,
    unplug: HandlerSlot,
    calls: Calls,
}

#[async_trait]
impl TrafficProbe for FakeProbe {
    async fn start(&mut self, events: EventGroup) -> Result<()> {
        self.calls.push("probe.start");
        if let Some(handler) = self.unplug.lock().unwrap().take() {
            handler(TerminalError::DeviceGone);
            return Ok(());
        }
        if self.echo {
            events.set(Conditions::GOT_DATA);
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.calls.push("probe.stop");
        Ok(())
    }
}

mock! {
    pub Session {}
    #[async_trait]
    impl LinkSession for Session {
        async fn read_pin_status(&mut self) -> Result<PinStatus>;

        async fn set_pin(&mut self, pin: &str) -> Result<()>;

        async fn signal_quality(&mut self) -> Result<SignalQuality>;

        async fn send_sms(&mut self, recipient: &str, text: &str) -> Result<()>;

        async fn set_mode(&mut self, mode: LinkMode) -> Result<()>;

        async fn imsi(&mut self) -> Result<String>;

        fn on_terminal_error(&mut self, handler: TerminalErrorHandler);

        async fn destroy(&mut self) -> Result<()>;
    }
}

mock! {
    pub Power {}
    #[async_trait]
    impl PowerControl for Power {
        async fn configure(&mut self) -> Result<()>;

        async fn set_line(&mut self, line: Line, level: Level) -> Result<()>;
    }
}
