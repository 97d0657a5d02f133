//! [`LinkSession`] backed by ModemManager's `mmcli`.

use super::{LinkMode, LinkSession, PinStatus, SignalQuality, TerminalErrorHandler, TerminalSlot};
use crate::{profile::DeviceProfile, transport::FlowControl, utils::run_cmd};
use async_trait::async_trait;
use color_eyre::{
    eyre::{bail, eyre, ContextCompat, WrapErr},
    Result,
};
use derive_more::Display;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use regex::Regex;
use std::{process::Stdio, sync::LazyLock, time::Duration};
use tokio::{
    process::{Child, Command},
    time,
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// How long pppd gets to hang up before it is killed.
const PPPD_GRACE: Duration = Duration::from_secs(5);

#[derive(Display, Debug, Clone, PartialEq, Eq)]
pub struct ModemId(String);

impl ModemId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<usize> for ModemId {
    fn from(id: usize) -> Self {
        Self(id.to_string())
    }
}

#[derive(Display, Debug, Clone, PartialEq, Eq)]
pub struct SimId(String);

impl SimId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<usize> for SimId {
    fn from(id: usize) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modem {
    pub id: ModemId,
    pub vendor: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemInfo {
    pub model: Option<String>,
    pub state: String,
    pub primary_port: Option<String>,
    pub ports: Vec<String>,
    pub unlock_required: Option<String>,
    pub sim: Option<SimId>,
    /// sysfs path of the underlying device.
    pub device: Option<String>,
    pub bearers: Vec<BearerId>,
}

impl ModemInfo {
    /// Only a locked SIM PIN needs us. PIN2 and PUK locks are left alone.
    pub fn pin_status(&self) -> PinStatus {
        match self.unlock_required.as_deref() {
            Some("sim-pin") => PinStatus::Required,
            _ => PinStatus::Ready,
        }
    }

    /// Whether the modem sits on the usb device with the given sysfs name
    /// (`1-1.2`).
    pub fn is_on_usb_device(&self, name: &str) -> bool {
        self.device
            .as_deref()
            .and_then(|device| device.rsplit('/').next())
            .is_some_and(|device| device == name)
    }

    /// Accepts either a device node (`/dev/ttyUSB2`) or a bare port name.
    pub fn uses_port(&self, port: &str) -> bool {
        let name = port.rsplit('/').next().unwrap_or(port);

        self.primary_port.as_deref() == Some(name)
            || self
                .ports
                .iter()
                .any(|p| p.split_whitespace().next() == Some(name))
    }
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locator<'a> {
    /// Serial port the modem answers on, `/dev/ttyS1` or `ttyS1`.
    #[display("port {_0}")]
    Port(&'a str),
    /// sysfs name of the usb device, `1-1.2`.
    #[display("usb device {_0}")]
    UsbDevice(&'a str),
}

impl Locator<'_> {
    pub fn matches(&self, info: &ModemInfo) -> bool {
        match self {
            Locator::Port(port) => info.uses_port(port),
            Locator::UsbDevice(name) => info.is_on_usb_device(name),
        }
    }
}

/// Finds the attached modem that fits `profile` and sits where `locator`
/// says.
pub async fn find_modem(profile: DeviceProfile, locator: Locator<'_>) -> Result<ModemId> {
    let output = run_cmd("mmcli", &["-L"]).await?;
    let candidates = parse_modem_list(&output)
        .into_iter()
        .filter(|m| profile.matches_model(&m.model));

    for modem in candidates {
        if locator.matches(&modem_info(&modem.id).await?) {
            info!(
                "found {} {} on {locator} as modem {}",
                modem.vendor, modem.model, modem.id
            );
            return Ok(modem.id);
        }
    }

    bail!("no {profile} modem found on {locator}")
}

async fn modem_info(modem: &ModemId) -> Result<ModemInfo> {
    let output = run_cmd("mmcli", &["-m", modem.as_str(), "-J"]).await?;
    parse_modem_info(&output)
}

#[derive(Display, Debug, Clone, PartialEq, Eq)]
pub struct BearerId(String);

impl BearerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<usize> for BearerId {
    fn from(id: usize) -> Self {
        Self(id.to_string())
    }
}

/// What ModemManager reports for a connected bearer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bearer {
    /// Data port for `ppp` bearers, network interface otherwise.
    pub interface: Option<String>,
    pub ipv4_method: Option<String>,
}

impl Bearer {
    /// ModemManager leaves PPP to its client.
    pub fn needs_pppd(&self) -> bool {
        self.ipv4_method.as_deref() == Some("ppp")
    }
}

/// Everything needed to bring the data link up once the modem is found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLink {
    pub apn: String,
    /// Passed to ModemManager's simple connect.
    pub connect_timeout: Duration,
    pub ppp: PppOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PppOptions {
    /// Interface pppd creates, and the one the daemon watches.
    pub netif: String,
    /// Line speed for serial ports, `None` for usb ttys.
    pub baud: Option<u32>,
    pub flow_control: FlowControl,
}

impl PppOptions {
    pub fn pppd_args(&self, port: &str) -> Vec<String> {
        let device = if port.starts_with('/') {
            port.to_string()
        } else {
            format!("/dev/{port}")
        };

        let mut args = vec![device];
        if let Some(baud) = self.baud {
            args.push(baud.to_string());
        }
        args.push(
            match self.flow_control {
                FlowControl::None => "nocrtscts",
                FlowControl::Software => "xonxoff",
                FlowControl::Hardware => "crtscts",
            }
            .to_string(),
        );
        args.extend(
            [
                "ifname",
                self.netif.as_str(),
                "nodetach",
                "noauth",
                "local",
                "noipdefault",
                "defaultroute",
                "usepeerdns",
                "lcp-echo-interval",
                "30",
                "lcp-echo-failure",
                "4",
            ]
            .map(str::to_string),
        );

        args
    }
}

pub struct MmcliSession {
    modem: ModemId,
    link: DataLink,
    pppd: Option<Child>,
    mode: LinkMode,
    signal_configured: bool,
    terminal: TerminalSlot,
    cancel: CancellationToken,
    _drop_guard: DropGuard,
}

impl MmcliSession {
    pub fn new(modem: ModemId, link: DataLink) -> Self {
        let cancel = CancellationToken::new();
        Self {
            modem,
            link,
            pppd: None,
            mode: LinkMode::Command,
            signal_configured: false,
            terminal: TerminalSlot::default(),
            _drop_guard: cancel.clone().drop_guard(),
            cancel,
        }
    }

    /// Shared with whatever watches the device for removal.
    pub fn terminal_slot(&self) -> TerminalSlot {
        self.terminal.clone()
    }

    /// Cancelled once the session is destroyed or dropped.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// RTS/CTS on the modem side.
    pub async fn set_hw_flow_control(&mut self) -> Result<()> {
        run_cmd(
            "mmcli",
            &["-m", self.modem.as_str(), "--command=AT+IFC=2,2"],
        )
        .await?;

        Ok(())
    }

    async fn sim(&self) -> Result<SimId> {
        modem_info(&self.modem)
            .await?
            .sim
            .wrap_err_with(|| format!("modem {} has no SIM", self.modem))
    }

    async fn bearer(&self) -> Result<Bearer> {
        let id = modem_info(&self.modem)
            .await?
            .bearers
            .pop()
            .wrap_err_with(|| format!("modem {} has no bearer", self.modem))?;
        let output = run_cmd("mmcli", &["-b", id.as_str(), "-J"]).await?;

        parse_bearer(&output)
    }

    /// Runs pppd on the bearer's data port, or checks that the bearer already
    /// came up on the watched interface.
    async fn attach(&mut self) -> Result<()> {
        let bearer = self.bearer().await?;
        let netif = &self.link.ppp.netif;

        if !bearer.needs_pppd() {
            match bearer.interface.as_deref() {
                Some(iface) if iface == netif => {}
                iface => warn!(
                    "bearer came up on {} ({}), not on {netif}",
                    iface.unwrap_or("--"),
                    bearer.ipv4_method.as_deref().unwrap_or("--")
                ),
            }
            return Ok(());
        }

        let port = bearer
            .interface
            .wrap_err("ppp bearer reports no data port")?;
        let args = self.link.ppp.pppd_args(&port);
        info!("starting pppd on {port} for {netif}");
        debug!("pppd {}", args.join(" "));

        let child = Command::new("pppd")
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .wrap_err("failed to start pppd")?;
        self.pppd = Some(child);

        Ok(())
    }

    async fn stop_pppd(&mut self) {
        let Some(mut child) = self.pppd.take() else {
            return;
        };

        if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok())
            && let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
        {
            warn!("failed to signal pppd: {e}");
        }

        match time::timeout(PPPD_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("pppd exited with {status}"),
            Ok(Err(e)) => warn!("failed to wait for pppd: {e}"),
            Err(_) => {
                warn!("pppd did not hang up in {PPPD_GRACE:?}, killing it");
                if let Err(e) = child.kill().await {
                    warn!("failed to kill pppd: {e}");
                }
            }
        }
    }
}

#[async_trait]
impl LinkSession for MmcliSession {
    async fn read_pin_status(&mut self) -> Result<PinStatus> {
        let info = modem_info(&self.modem).await?;
        debug!("modem {} is {}", self.modem, info.state);

        Ok(info.pin_status())
    }

    async fn set_pin(&mut self, pin: &str) -> Result<()> {
        let sim = self.sim().await?;
        let pin = format!("--pin={pin}");

        // the mmcli error would echo the pin
        run_cmd("mmcli", &["-i", sim.as_str(), &pin])
            .await
            .map_err(|_| eyre!("SIM {sim} rejected the PIN"))?;

        Ok(())
    }

    async fn signal_quality(&mut self) -> Result<SignalQuality> {
        if !self.signal_configured {
            run_cmd("mmcli", &["-m", self.modem.as_str(), "--signal-setup=5"]).await?;
            self.signal_configured = true;
        }

        let output =
            run_cmd("mmcli", &["-m", self.modem.as_str(), "--signal-get", "-J"]).await?;

        parse_signal(&output)
    }

    async fn send_sms(&mut self, recipient: &str, text: &str) -> Result<()> {
        if text.contains('\'') || recipient.contains('\'') {
            bail!("sms text and recipient must not contain single quotes");
        }

        let create = format!("--messaging-create-sms=text='{text}',number='{recipient}'");
        let output = run_cmd("mmcli", &["-m", self.modem.as_str(), &create]).await?;
        let sms = parse_created_sms(&output)?;

        run_cmd("mmcli", &["-s", &sms, "--send"]).await?;
        info!("sms {sms} sent to {recipient}");

        Ok(())
    }

    async fn set_mode(&mut self, mode: LinkMode) -> Result<()> {
        match mode {
            LinkMode::Data => {
                let timeout = format!("--timeout={}", self.link.connect_timeout.as_secs());
                let connect =
                    format!("--simple-connect=apn={},ip-type=ipv4v6", self.link.apn);
                run_cmd("mmcli", &["-m", self.modem.as_str(), &timeout, &connect]).await?;
                // from here on the bearer is up and must be torn down again
                self.mode = LinkMode::Data;
                self.attach().await?;
            }
            LinkMode::Command => {
                self.stop_pppd().await;
                run_cmd("mmcli", &["-m", self.modem.as_str(), "--simple-disconnect"])
                    .await?;
            }
        }

        self.mode = mode;
        Ok(())
    }

    async fn imsi(&mut self) -> Result<String> {
        let sim = self.sim().await?;
        let output = run_cmd("mmcli", &["-i", sim.as_str(), "-J"]).await?;

        parse_sim_imsi(&output)
    }

    fn on_terminal_error(&mut self, handler: TerminalErrorHandler) {
        self.terminal.set(handler);
    }

    async fn destroy(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.stop_pppd().await;

        if self.mode == LinkMode::Data {
            // the device may already be gone, nothing else to release then
            if let Err(e) =
                run_cmd("mmcli", &["-m", self.modem.as_str(), "--simple-disconnect"]).await
            {
                warn!("failed to leave data mode on modem {}: {e}", self.modem);
            }
            self.mode = LinkMode::Command;
        }

        debug!("session on modem {} destroyed", self.modem);
        Ok(())
    }
}

macro_rules! jerr {
    ($s:expr) => {
        format!("could not get {}", $s)
    };
}

fn parse_modem_list(str: &str) -> Vec<Modem> {
    static RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^/org/freedesktop/ModemManager\d+/Modem/(?P<id>\d+)\s+\[(?P<vendor>[^\]]+)]\s+(?P<model>.+)$").unwrap()
    });

    str.lines()
        .map(|line| line.trim())
        .filter_map(|line| {
            let captures = RE.captures(line)?;
            let id = captures.name("id")?.as_str().parse::<usize>().ok()?;
            let vendor = captures.name("vendor")?.as_str().to_string();
            let model = captures.name("model")?.as_str().to_string();

            Some(Modem {
                id: id.into(),
                vendor,
                model,
            })
        })
        .collect()
}

fn parse_modem_info(str: &str) -> Result<ModemInfo> {
    let json: serde_json::Value = serde_json::from_str(str)?;
    let generic = &json["modem"]["generic"];

    let state = generic["state"]
        .as_str()
        .wrap_err(jerr!("modem.generic.state"))?
        .trim()
        .to_string();

    let known = |v: &serde_json::Value| {
        v.as_str()
            .filter(|s| *s != "--")
            .map(|s| s.to_string())
    };

    let ports = generic["ports"]
        .as_array()
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| p.as_str().map(|p| p.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let sim = generic["sim"]
        .as_str()
        .and_then(dbus_index)
        .map(SimId::from);

    let bearers = generic["bearers"]
        .as_array()
        .map(|bearers| {
            bearers
                .iter()
                .filter_map(|b| b.as_str().and_then(dbus_index))
                .map(BearerId::from)
                .collect()
        })
        .unwrap_or_default();

    Ok(ModemInfo {
        model: known(&generic["model"]),
        state,
        primary_port: known(&generic["primary-port"]),
        ports,
        unlock_required: known(&generic["unlock-required"]),
        sim,
        device: known(&generic["device"]),
        bearers,
    })
}

/// Trailing index of a ModemManager object path.
fn dbus_index(path: &str) -> Option<usize> {
    path.rsplit('/').next()?.parse().ok()
}

fn parse_bearer(str: &str) -> Result<Bearer> {
    let json: serde_json::Value = serde_json::from_str(str)?;
    let bearer = &json["bearer"];
    if bearer.is_null() {
        bail!(jerr!("bearer"));
    }

    let known = |v: &serde_json::Value| {
        v.as_str()
            .filter(|s| *s != "--")
            .map(|s| s.to_string())
    };

    Ok(Bearer {
        interface: known(&bearer["status"]["interface"]),
        ipv4_method: known(&bearer["ipv4-config"]["method"]),
    })
}

fn parse_signal(str: &str) -> Result<SignalQuality> {
    let json: serde_json::Value = serde_json::from_str(str)?;

    let get = |field: &str| -> Option<f64> {
        ["5g", "lte", "gsm", "umts", "cdma1x", "evdo"]
            .iter()
            .find_map(|access_tech| {
                json["modem"]["signal"][access_tech][field]
                    .as_str()
                    .and_then(|x| x.parse().ok())
            })
    };

    Ok(SignalQuality {
        rssi: get("rssi"),
        ber: get("error-rate"),
    })
}

fn parse_sim_imsi(str: &str) -> Result<String> {
    let json: serde_json::Value = serde_json::from_str(str)?;

    json["sim"]["properties"]["imsi"]
        .as_str()
        .filter(|imsi| *imsi != "--")
        .map(|imsi| imsi.to_string())
        .wrap_err(jerr!("sim.properties.imsi"))
}

fn parse_created_sms(str: &str) -> Result<String> {
    static RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"/SMS/(?P<id>\d+)").unwrap());

    RE.captures(str)
        .and_then(|c| c.name("id"))
        .map(|id| id.as_str().to_string())
        .wrap_err_with(|| format!("unexpected mmcli output creating sms: {str}"))
}
