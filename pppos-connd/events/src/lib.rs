use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Where a [`Notification`] originated.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    #[display("ip")]
    Ip,
    #[display("ppp")]
    Ppp,
    #[display("terminal")]
    Terminal,
}

/// Every asynchronous notification the daemon reacts to.
#[derive(From, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    Ip(IpEvent),
    Ppp(PppEvent),
    Terminal(TerminalError),
}

impl Notification {
    pub fn source(&self) -> Source {
        match self {
            Notification::Ip(_) => Source::Ip,
            Notification::Ppp(_) => Source::Ppp,
            Notification::Terminal(_) => Source::Terminal,
        }
    }
}

/// IPv4 configuration assigned to the interface once the data link is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Info {
    pub netif: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns_primary: Option<Ipv4Addr>,
    pub dns_secondary: Option<Ipv4Addr>,
}

/// IP-layer events. Ordered within the stream, at-least-once.
#[derive(Display, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpEvent {
    #[display("{}: got ip {}", _0.netif, _0.ip)]
    GotIp(Ipv4Info),
    #[display("{netif}: lost ip")]
    LostIp { netif: String },
    #[display("{netif}: got ipv6 {addr}")]
    GotIpv6 { netif: String, addr: Ipv6Addr },
}

/// Link-layer events.
#[derive(Display, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PppEvent {
    #[display("{netif}: link up")]
    LinkUp { netif: String },
    #[display("{netif}: link down")]
    LinkDown { netif: String },
    /// The link was torn down on our own request.
    #[display("{netif}: user interrupted")]
    UserInterrupted { netif: String },
}

/// Reported by a transport when it can no longer talk to the device.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalError {
    /// The device physically went away (e.g. USB unplug).
    #[display("device gone")]
    DeviceGone,
    /// The transport saw traffic it did not expect in its current state.
    #[display("unexpected control flow")]
    UnexpectedControlFlow,
    #[display("unknown terminal error")]
    Unknown,
}
