//! The PPP network interface and the notifications it produces.
//!
//! [`Netif::spawn`] starts a watcher that polls the interface and turns
//! changes into [`IpEvent`]s and [`PppEvent`]s. Interface presence comes from
//! sysfs, flags and addresses from `getifaddrs`, the default gateway from
//! `/proc/net/route` and name servers from resolv.conf.

pub mod stats;

use async_trait::async_trait;
use color_eyre::{eyre::WrapErr, Result};
use nix::{
    ifaddrs,
    net::if_::InterfaceFlags,
    sys::socket::SockaddrStorage,
};
use pppos_connd_events::{IpEvent, Ipv4Info, Notification, PppEvent};
use stats::NetStats;
use std::{
    collections::BTreeSet,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs,
    sync::Notify,
    task::{self, JoinHandle},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[async_trait]
pub trait NetworkInterface: Send + Sync {
    fn name(&self) -> &str;

    async fn stats(&self) -> Result<NetStats>;

    /// Reports the current address again, even if it did not change since
    /// the last report.
    fn resync(&self);

    /// Stops reporting on the interface.
    async fn destroy(&mut self) -> Result<()>;
}

pub struct NotificationStreams {
    pub ip: flume::Receiver<IpEvent>,
    pub ppp: flume::Receiver<PppEvent>,
}

#[derive(Debug, Clone)]
pub struct NetifConfig {
    pub name: String,
    pub resolv_conf: PathBuf,
    pub route_table: PathBuf,
    pub poll_interval: Duration,
}

pub struct Netif {
    name: String,
    sysfs: PathBuf,
    ppp_tx: flume::Sender<PppEvent>,
    resync: Arc<Notify>,
    cancel: CancellationToken,
    watcher: Option<JoinHandle<()>>,
}

impl Netif {
    pub fn spawn(config: NetifConfig, sysfs: impl AsRef<Path>) -> (Netif, NotificationStreams) {
        let (ip_tx, ip_rx) = flume::unbounded();
        let (ppp_tx, ppp_rx) = flume::unbounded();
        let sysfs = sysfs.as_ref().to_path_buf();
        let resync = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        info!("watching network interface {}", config.name);
        let watcher = task::spawn(watch(
            config.clone(),
            sysfs.clone(),
            ip_tx,
            ppp_tx.clone(),
            resync.clone(),
            cancel.clone(),
        ));

        let netif = Netif {
            name: config.name,
            sysfs,
            ppp_tx,
            resync,
            cancel,
            watcher: Some(watcher),
        };

        (
            netif,
            NotificationStreams {
                ip: ip_rx,
                ppp: ppp_rx,
            },
        )
    }
}

#[async_trait]
impl NetworkInterface for Netif {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stats(&self) -> Result<NetStats> {
        NetStats::collect(&self.sysfs, &self.name).await
    }

    fn resync(&self) {
        self.resync.notify_one();
    }

    async fn destroy(&mut self) -> Result<()> {
        let Some(watcher) = self.watcher.take() else {
            return Ok(());
        };

        self.cancel.cancel();
        if let Err(e) = watcher.await {
            warn!("netif watcher for {} ended abnormally: {e}", self.name);
        }

        let _ = self.ppp_tx.send(PppEvent::UserInterrupted {
            netif: self.name.clone(),
        });

        Ok(())
    }
}

async fn watch(
    config: NetifConfig,
    sysfs: PathBuf,
    ip_tx: flume::Sender<IpEvent>,
    ppp_tx: flume::Sender<PppEvent>,
    resync: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut tracker = LinkTracker::new(&config.name);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = resync.notified() => {
                debug!("{}: resync requested", config.name);
                tracker.forget_address();
            }
            () = time::sleep(config.poll_interval) => {}
        }

        let next = match snapshot(&config, &sysfs).await {
            Ok(next) => next,
            Err(e) => {
                debug!("failed to inspect {}: {e}", config.name);
                continue;
            }
        };

        for change in tracker.observe(next) {
            // receivers only go away at shutdown
            match change {
                Notification::Ip(ev) => {
                    let _ = ip_tx.send(ev);
                }
                Notification::Ppp(ev) => {
                    let _ = ppp_tx.send(ev);
                }
                Notification::Terminal(_) => {}
            }
        }
    }
}

/// Turns successive snapshots of one interface into notifications.
#[derive(Debug)]
pub struct LinkTracker {
    netif: String,
    prev: LinkSnapshot,
}

impl LinkTracker {
    pub fn new(netif: &str) -> Self {
        Self {
            netif: netif.to_string(),
            prev: LinkSnapshot::default(),
        }
    }

    pub fn observe(&mut self, next: LinkSnapshot) -> Vec<Notification> {
        let changes = diff(&self.netif, &self.prev, &next);
        self.prev = next;
        changes
    }

    /// The next snapshot holding an address reports it as new.
    pub fn forget_address(&mut self) {
        self.prev.v4 = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Addressing {
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
    pub peer: Option<Ipv4Addr>,
}

/// What the interface looked like at one poll.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkSnapshot {
    pub up: bool,
    pub v4: Option<Ipv4Addressing>,
    pub v6: BTreeSet<Ipv6Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
}

/// One `getifaddrs` entry of the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfAddr {
    pub up: bool,
    pub address: Option<IpAddr>,
    pub netmask: Option<IpAddr>,
    /// Far end of a point-to-point link.
    pub peer: Option<IpAddr>,
}

async fn snapshot(config: &NetifConfig, sysfs: &Path) -> Result<LinkSnapshot> {
    let iface_dir = sysfs.join("class").join("net").join(&config.name);
    if fs::metadata(&iface_dir).await.is_err() {
        return Ok(LinkSnapshot::default());
    }

    let mut snapshot = link_snapshot(&interface_addresses(&config.name)?);

    snapshot.gateway = match fs::read_to_string(&config.route_table).await {
        Ok(table) => parse_route_table(&table, &config.name),
        Err(e) => {
            debug!("failed to read {}: {e}", config.route_table.display());
            None
        }
    };

    snapshot.dns = fs::read_to_string(&config.resolv_conf)
        .await
        .map(|conf| parse_resolv_conf(&conf))
        .unwrap_or_default();

    Ok(snapshot)
}

fn interface_addresses(name: &str) -> Result<Vec<IfAddr>> {
    let addrs = ifaddrs::getifaddrs().wrap_err("failed to list interface addresses")?;

    Ok(addrs
        .filter(|a| a.interface_name == name)
        .map(|a| IfAddr {
            up: a.flags.contains(InterfaceFlags::IFF_UP),
            address: a.address.as_ref().and_then(ip_of),
            netmask: a.netmask.as_ref().and_then(ip_of),
            peer: a.destination.as_ref().and_then(ip_of),
        })
        .collect())
}

fn ip_of(addr: &SockaddrStorage) -> Option<IpAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        return Some(IpAddr::V4(*SocketAddrV4::from(*v4).ip()));
    }

    addr.as_sockaddr_in6()
        .map(|v6| IpAddr::V6(*SocketAddrV6::from(*v6).ip()))
}

/// Folds the interface's address entries into a snapshot. Only the first
/// IPv4 address and global IPv6 addresses are kept.
pub fn link_snapshot(entries: &[IfAddr]) -> LinkSnapshot {
    let mut snapshot = LinkSnapshot {
        up: entries.iter().any(|e| e.up),
        ..Default::default()
    };

    for entry in entries {
        match entry.address {
            Some(IpAddr::V4(ip)) if snapshot.v4.is_none() => {
                let prefix_len = match entry.netmask {
                    Some(IpAddr::V4(mask)) => u32::from(mask).count_ones() as u8,
                    _ => 32,
                };
                let peer = match entry.peer {
                    Some(IpAddr::V4(peer)) => Some(peer),
                    _ => None,
                };
                snapshot.v4 = Some(Ipv4Addressing {
                    ip,
                    prefix_len,
                    peer,
                });
            }
            Some(IpAddr::V6(ip)) if is_global_v6(&ip) => {
                snapshot.v6.insert(ip);
            }
            _ => {}
        }
    }

    snapshot
}

fn is_global_v6(ip: &Ipv6Addr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified() && !ip.is_unicast_link_local()
}

/// Notifications implied by going from `prev` to `next`.
pub fn diff(netif: &str, prev: &LinkSnapshot, next: &LinkSnapshot) -> Vec<Notification> {
    let netif = netif.to_string();
    let mut changes = Vec::new();

    match (prev.up, next.up) {
        (false, true) => changes.push(PppEvent::LinkUp { netif: netif.clone() }.into()),
        (true, false) => changes.push(PppEvent::LinkDown { netif: netif.clone() }.into()),
        _ => {}
    }

    match (prev.v4, next.v4) {
        (prev_v4, Some(v4)) if prev_v4.map(|p| p.ip) != Some(v4.ip) => {
            let info = Ipv4Info {
                netif: netif.clone(),
                ip: v4.ip,
                netmask: netmask(v4.prefix_len),
                gateway: next.gateway.or(v4.peer).unwrap_or(Ipv4Addr::UNSPECIFIED),
                dns_primary: next.dns.first().copied(),
                dns_secondary: next.dns.get(1).copied(),
            };
            changes.push(IpEvent::GotIp(info).into());
        }
        (Some(_), None) => changes.push(IpEvent::LostIp { netif: netif.clone() }.into()),
        _ => {}
    }

    for addr in next.v6.difference(&prev.v6) {
        changes.push(
            IpEvent::GotIpv6 {
                netif: netif.clone(),
                addr: *addr,
            }
            .into(),
        );
    }

    changes
}

fn netmask(prefix_len: u8) -> Ipv4Addr {
    let bits = u32::MAX
        .checked_shl(32 - u32::from(prefix_len.min(32)))
        .unwrap_or(0);
    Ipv4Addr::from(bits)
}

/// Gateway of the default route through `netif`. A point-to-point default
/// route has none.
fn parse_route_table(table: &str, netif: &str) -> Option<Ipv4Addr> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [iface, destination, gateway, ..] = fields.as_slice() else {
            return None;
        };
        if *iface != netif || *destination != "00000000" {
            return None;
        }

        // the kernel prints the address as a host-order integer
        let raw = u32::from_str_radix(gateway, 16).ok()?;
        let gateway = Ipv4Addr::from(raw.to_ne_bytes());

        (!gateway.is_unspecified()).then_some(gateway)
    })
}

fn parse_resolv_conf(str: &str) -> Vec<Ipv4Addr> {
    str.lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match words.next() {
                Some("nameserver") => words.next()?.parse().ok(),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
ppp0\t00000000\t00000000\t0001\t0\t0\t0\t00000000\t0\t0\t0
ppp0\t40404040\t00000000\t0005\t0\t0\t0\tFFFFFFFF\t0\t0\t0
";

    fn ppp_entries() -> Vec<IfAddr> {
        vec![
            IfAddr {
                up: true,
                address: Some(IpAddr::V4(Ipv4Addr::new(10, 91, 32, 7))),
                netmask: Some(IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255))),
                peer: Some(IpAddr::V4(Ipv4Addr::new(10, 64, 64, 64))),
            },
            IfAddr {
                up: true,
                address: Some(IpAddr::V6("fe80::a4f1:2bd0:1c33:9e01".parse().unwrap())),
                netmask: None,
                peer: Some(IpAddr::V6("fe80::1".parse().unwrap())),
            },
            IfAddr {
                up: true,
                address: Some(IpAddr::V6("2a01:598:b1a0:2b4::1".parse().unwrap())),
                netmask: None,
                peer: None,
            },
        ]
    }

    fn connected() -> LinkSnapshot {
        link_snapshot(&ppp_entries())
    }

    #[test]
    fn it_folds_interface_addresses() {
        let actual = connected();

        assert!(actual.up);
        assert_eq!(
            actual.v4,
            Some(Ipv4Addressing {
                ip: Ipv4Addr::new(10, 91, 32, 7),
                prefix_len: 32,
                peer: Some(Ipv4Addr::new(10, 64, 64, 64)),
            })
        );
        assert_eq!(
            actual.v6.into_iter().collect::<Vec<_>>(),
            vec!["2a01:598:b1a0:2b4::1".parse::<Ipv6Addr>().unwrap()]
        );
    }

    #[test]
    fn a_link_without_addresses_is_only_up() {
        let actual = link_snapshot(&[IfAddr {
            up: true,
            address: None,
            netmask: None,
            peer: None,
        }]);

        assert_eq!(
            actual,
            LinkSnapshot {
                up: true,
                ..Default::default()
            }
        );
        assert_eq!(link_snapshot(&[]), LinkSnapshot::default());
    }

    #[test]
    fn it_parses_the_default_gateway_per_interface() {
        assert_eq!(
            parse_route_table(ROUTES, "eth0"),
            Some(Ipv4Addr::from(0x0101A8C0u32.to_ne_bytes()))
        );
        assert_eq!(parse_route_table(ROUTES, "ppp0"), None);
        assert_eq!(parse_route_table(ROUTES, "wwan0"), None);
        assert_eq!(parse_route_table("", "ppp0"), None);
    }

    #[test]
    fn it_parses_nameservers() {
        let conf = "# generated by pppd\nnameserver 10.74.210.210\nnameserver 10.74.210.211\nnameserver fd00::1\nsearch lan\n";

        assert_eq!(
            parse_resolv_conf(conf),
            vec![
                Ipv4Addr::new(10, 74, 210, 210),
                Ipv4Addr::new(10, 74, 210, 211)
            ]
        );
    }

    #[test]
    fn acquiring_an_address_reports_link_and_ip() {
        let mut next = connected();
        next.dns = vec![Ipv4Addr::new(10, 74, 210, 210)];

        let changes = diff("ppp0", &LinkSnapshot::default(), &next);

        assert_eq!(
            changes,
            vec![
                PppEvent::LinkUp {
                    netif: "ppp0".to_string()
                }
                .into(),
                IpEvent::GotIp(Ipv4Info {
                    netif: "ppp0".to_string(),
                    ip: Ipv4Addr::new(10, 91, 32, 7),
                    netmask: Ipv4Addr::new(255, 255, 255, 255),
                    gateway: Ipv4Addr::new(10, 64, 64, 64),
                    dns_primary: Some(Ipv4Addr::new(10, 74, 210, 210)),
                    dns_secondary: None,
                })
                .into(),
                IpEvent::GotIpv6 {
                    netif: "ppp0".to_string(),
                    addr: "2a01:598:b1a0:2b4::1".parse().unwrap(),
                }
                .into(),
            ]
        );
    }

    #[test]
    fn unchanged_link_reports_nothing() {
        assert!(diff("ppp0", &connected(), &connected()).is_empty());
    }

    #[test]
    fn forgotten_address_is_reported_again() {
        let mut tracker = LinkTracker::new("ppp0");
        assert_eq!(tracker.observe(connected()).len(), 3);
        assert!(tracker.observe(connected()).is_empty());

        tracker.forget_address();
        let changes = tracker.observe(connected());

        assert!(matches!(
            changes.as_slice(),
            [Notification::Ip(IpEvent::GotIp(info))] if info.ip == Ipv4Addr::new(10, 91, 32, 7)
        ));
    }

    #[test]
    fn default_route_takes_precedence_over_peer() {
        let mut next = connected();
        next.gateway = Some(Ipv4Addr::new(192, 168, 0, 1));

        let changes = diff("ppp0", &LinkSnapshot::default(), &next);

        let Some(Notification::Ip(IpEvent::GotIp(info))) = changes.get(1) else {
            panic!("expected GotIp, got {changes:?}");
        };
        assert_eq!(info.gateway, Ipv4Addr::new(192, 168, 0, 1));
    }

    #[test]
    fn losing_the_link_reports_link_down_and_lost_ip() {
        let changes = diff("ppp0", &connected(), &LinkSnapshot::default());

        assert_eq!(
            changes,
            vec![
                PppEvent::LinkDown {
                    netif: "ppp0".to_string()
                }
                .into(),
                IpEvent::LostIp {
                    netif: "ppp0".to_string()
                }
                .into(),
            ]
        );
    }

    #[test]
    fn netmask_from_prefix() {
        assert_eq!(netmask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(netmask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(netmask(0), Ipv4Addr::new(0, 0, 0, 0));
    }

    #[tokio::test]
    async fn destroy_reports_user_interrupt_once() {
        let sysfs = tempfile::tempdir().unwrap();
        let config = NetifConfig {
            name: "ppp0".to_string(),
            resolv_conf: sysfs.path().join("resolv.conf"),
            route_table: sysfs.path().join("route"),
            poll_interval: Duration::from_secs(3600),
        };
        let (mut netif, streams) = Netif::spawn(config, sysfs.path());

        netif.destroy().await.unwrap();
        netif.destroy().await.unwrap();

        assert_eq!(
            streams.ppp.drain().collect::<Vec<_>>(),
            vec![PppEvent::UserInterrupted {
                netif: "ppp0".to_string()
            }]
        );
        assert!(streams.ip.is_empty());
    }
}
