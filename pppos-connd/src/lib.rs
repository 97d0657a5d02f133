use color_eyre::eyre::Result;
use config::{Config, TransportConfig};
use event_group::EventGroup;
use netif::Netif;
use orchestrator::{Orchestrator, Outcome};
use power::{sysfs::SysfsGpio, PowerSequencer};
use probe::MqttProbe;
use session::mmcli::{DataLink, PppOptions};
use std::path::Path;
use tracing::{debug, info};
use transport::{FlowControl, Transport, UartTransport, UsbTransport};

pub mod config;
pub mod event_group;
pub mod netif;
pub mod observer;
pub mod orchestrator;
pub mod power;
pub mod probe;
pub mod profile;
pub mod session;
pub mod transport;

mod utils;

/// Wires the real backends together and runs the orchestrator to
/// completion.
#[bon::builder(finish_fn = run)]
pub async fn program(config: Config, sysfs: impl AsRef<Path>) -> Result<Outcome> {
    let sysfs = sysfs.as_ref().to_path_buf();
    info!(
        "pppos-connd starting: {} modem, apn {}",
        config.profile, config.apn
    );
    debug!("{config:?}");

    let events = EventGroup::new();

    let (netif, streams) = Netif::spawn(config.netif.clone(), &sysfs);
    let observer = observer::spawn(streams.ip, streams.ppp, events.clone());

    let power = PowerSequencer::new(
        SysfsGpio::new(
            &sysfs,
            config.power.supply_enable_gpio,
            config.power.power_key_gpio,
        ),
        config.power.timings,
    );

    let link = DataLink {
        apn: config.apn.clone(),
        connect_timeout: config.timeouts.connect,
        ppp: PppOptions {
            netif: config.netif.name.clone(),
            baud: None,
            flow_control: FlowControl::None,
        },
    };
    let transport: Box<dyn Transport> = match &config.transport {
        TransportConfig::Uart(uart) => {
            Box::new(UartTransport::new(uart.clone(), config.profile, link))
        }
        TransportConfig::Usb { usb, poll_interval } => Box::new(UsbTransport::new(
            *usb,
            config.profile,
            link,
            *poll_interval,
        )),
    };

    let probe = MqttProbe::new(
        &config.mqtt.broker_uri,
        &config.mqtt.topic,
        &config.mqtt.payload,
    )?;

    let orchestrator = Orchestrator::builder()
        .power(power)
        .transport(transport)
        .netif(Box::new(netif))
        .probe(Box::new(probe))
        .events(events)
        .maybe_pin(config.pin)
        .maybe_sms(config.sms)
        .maybe_ip_timeout(config.timeouts.ip)
        .maybe_probe_timeout(config.timeouts.probe)
        .maybe_max_sessions(config.max_sessions)
        .build();

    let result = orchestrator.run().await;
    observer.abort();

    let outcome = result?;
    info!("finished: {outcome:?}");

    Ok(outcome)
}
