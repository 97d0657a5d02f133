use crate::{
    netif::NetifConfig,
    orchestrator::Sms,
    power::PowerTimings,
    profile::DeviceProfile,
    transport::{FlowControl, UartConfig, UsbConfig},
    utils::secs_or_unbounded,
};
use clap::{Parser, ValueEnum};
use derive_more::Display;
use secrecy::SecretString;
use std::{path::PathBuf, time::Duration};

/// Primary application configuration struct
#[derive(Debug, Clone)]
pub struct Config {
    pub apn: String,
    pub profile: DeviceProfile,
    pub transport: TransportConfig,
    pub pin: Option<SecretString>,
    pub sms: Option<Sms>,
    pub mqtt: MqttConfig,
    pub netif: NetifConfig,
    pub power: PowerConfig,
    pub timeouts: Timeouts,
    /// Hot-plug only. Stop after this many sessions ended with the device
    /// going away.
    pub max_sessions: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Uart(UartConfig),
    Usb {
        usb: UsbConfig,
        poll_interval: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub broker_uri: String,
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerConfig {
    pub supply_enable_gpio: u32,
    pub power_key_gpio: u32,
    pub timings: PowerTimings,
}

/// `None` waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub ip: Option<Duration>,
    pub probe: Option<Duration>,
    /// Passed to ModemManager when bringing up the data link.
    pub connect: Duration,
}

impl Config {
    /// Create a new config from CLI arguments
    pub fn from_cli(cli: &Cli) -> Self {
        let poll_interval = Duration::from_millis(cli.poll_interval_ms);

        let transport = match cli.transport {
            TransportKind::Uart => TransportConfig::Uart(UartConfig {
                port: cli.port.clone(),
                baud: cli.baud,
                flow_control: cli.flow_control,
            }),
            TransportKind::Usb => TransportConfig::Usb {
                usb: UsbConfig {
                    vid: cli.usb_vid,
                    pid: cli.usb_pid,
                    interface: cli.usb_interface,
                },
                poll_interval,
            },
        };

        let sms = cli.sms_recipient.as_ref().map(|recipient| Sms {
            recipient: recipient.clone(),
            text: cli.sms_text.clone(),
        });

        let mqtt = MqttConfig {
            broker_uri: cli.broker_uri.clone(),
            topic: cli.mqtt_topic.clone(),
            payload: cli.mqtt_payload.clone(),
        };

        let netif = NetifConfig {
            name: cli.netif.clone(),
            resolv_conf: PathBuf::from(&cli.resolv_conf),
            route_table: PathBuf::from(&cli.route_table),
            poll_interval,
        };

        let power = PowerConfig {
            supply_enable_gpio: cli.gpio_supply_enable,
            power_key_gpio: cli.gpio_power_key,
            timings: PowerTimings::default(),
        };

        let timeouts = Timeouts {
            ip: secs_or_unbounded(cli.ip_timeout_secs),
            probe: secs_or_unbounded(cli.probe_timeout_secs),
            connect: Duration::from_secs(cli.connect_timeout_secs),
        };

        Self {
            apn: cli.apn.clone(),
            profile: cli.profile,
            transport,
            pin: cli.pin.clone().map(SecretString::new),
            sms,
            mqtt,
            netif,
            power,
            timeouts,
            max_sessions: cli.max_sessions,
        }
    }
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Modem wired to a serial port.
    #[display("uart")]
    Uart,
    /// Modem that can be plugged in and out.
    #[display("usb")]
    Usb,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[arg(long, env = "PPPOS_APN", default_value = "internet")]
    pub apn: String,

    #[arg(long, env = "PPPOS_TRANSPORT", value_enum, default_value_t = TransportKind::Uart)]
    pub transport: TransportKind,

    #[arg(long, env = "PPPOS_PROFILE", value_enum, default_value_t = DeviceProfile::Generic)]
    pub profile: DeviceProfile,

    #[arg(long, env = "PPPOS_PORT", default_value = "/dev/ttyS1", help = "Serial port of a fixed-wire modem")]
    pub port: String,

    #[arg(long, env = "PPPOS_BAUD", default_value_t = 115200)]
    pub baud: u32,

    #[arg(long, env = "PPPOS_FLOW_CONTROL", value_enum, default_value_t = FlowControl::None)]
    pub flow_control: FlowControl,

    #[arg(long, env = "PPPOS_USB_VID", default_value = "0x1e0e", value_parser = parse_hex_u16)]
    pub usb_vid: u16,

    #[arg(long, env = "PPPOS_USB_PID", default_value = "0x9206", value_parser = parse_hex_u16)]
    pub usb_pid: u16,

    #[arg(long, env = "PPPOS_USB_INTERFACE", default_value_t = 2)]
    pub usb_interface: u8,

    #[arg(long, env = "PPPOS_SIM_PIN", hide_env_values = true)]
    pub pin: Option<String>,

    #[arg(long, env = "PPPOS_SMS_RECIPIENT", help = "Send a test sms to this number before going online")]
    pub sms_recipient: Option<String>,

    #[arg(long, env = "PPPOS_SMS_TEXT", default_value = "Text message from pppos-connd")]
    pub sms_text: String,

    #[arg(long, env = "PPPOS_BROKER_URI", default_value = "mqtt://mqtt.eclipseprojects.io")]
    pub broker_uri: String,

    #[arg(long, env = "PPPOS_MQTT_TOPIC", default_value = "/topic/pppos-connd")]
    pub mqtt_topic: String,

    #[arg(long, env = "PPPOS_MQTT_PAYLOAD", default_value = "pppos-connd")]
    pub mqtt_payload: String,

    #[arg(long, env = "PPPOS_NETIF", default_value = "ppp0")]
    pub netif: String,

    #[arg(long, env = "PPPOS_RESOLV_CONF", default_value = "/etc/resolv.conf")]
    pub resolv_conf: String,

    #[arg(long, env = "PPPOS_ROUTE_TABLE", default_value = "/proc/net/route")]
    pub route_table: String,

    #[arg(long, env = "PPPOS_GPIO_SUPPLY_ENABLE", default_value_t = 21)]
    pub gpio_supply_enable: u32,

    #[arg(long, env = "PPPOS_GPIO_POWER_KEY", default_value_t = 15)]
    pub gpio_power_key: u32,

    #[arg(long, env = "PPPOS_IP_TIMEOUT_SECS", default_value_t = 90, help = "0 waits forever")]
    pub ip_timeout_secs: u64,

    #[arg(long, env = "PPPOS_PROBE_TIMEOUT_SECS", default_value_t = 60, help = "0 waits forever")]
    pub probe_timeout_secs: u64,

    #[arg(long, env = "PPPOS_CONNECT_TIMEOUT_SECS", default_value_t = 30)]
    pub connect_timeout_secs: u64,

    #[arg(long, env = "PPPOS_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    #[arg(long, env = "PPPOS_MAX_SESSIONS")]
    pub max_sessions: Option<u32>,
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);

    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id {s}: {e}"))
}
