use crate::{
    event_group::{Conditions, EventGroup},
    session::TerminalErrorHandler,
};
use color_eyre::Result;
use pppos_connd_events::{IpEvent, Notification, PppEvent, TerminalError};
use std::{net::Ipv4Addr, sync::Arc};
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Drains both notification streams until they close.
pub fn spawn(
    ip: flume::Receiver<IpEvent>,
    ppp: flume::Receiver<PppEvent>,
    events: EventGroup,
) -> JoinHandle<Result<()>> {
    info!("starting network attachment observer");
    task::spawn(async move {
        let mut ip_open = true;
        let mut ppp_open = true;

        while ip_open || ppp_open {
            let notification: Notification = tokio::select! {
                ev = ip.recv_async(), if ip_open => match ev {
                    Ok(ev) => ev.into(),
                    Err(_) => {
                        ip_open = false;
                        continue;
                    }
                },
                ev = ppp.recv_async(), if ppp_open => match ev {
                    Ok(ev) => ev.into(),
                    Err(_) => {
                        ppp_open = false;
                        continue;
                    }
                },
            };

            handle(&notification, &events);
        }

        debug!("notification streams closed");
        Ok(())
    })
}

/// Terminal errors skip the streams and are handled on the reporting task.
pub fn terminal_error_handler(events: EventGroup) -> TerminalErrorHandler {
    Arc::new(move |err: TerminalError| handle(&Notification::Terminal(err), &events))
}

pub fn handle(notification: &Notification, events: &EventGroup) {
    debug!(source = %notification.source(), "{notification:?}");

    match notification {
        Notification::Ip(IpEvent::GotIp(info)) => {
            let or_unset = |dns: Option<Ipv4Addr>| dns.unwrap_or(Ipv4Addr::UNSPECIFIED);

            info!("modem connected to PPP server");
            info!("~~~~~~~~~~~~~~");
            info!("IP          : {}", info.ip);
            info!("Netmask     : {}", info.netmask);
            info!("Gateway     : {}", info.gateway);
            info!("Name Server1: {}", or_unset(info.dns_primary));
            info!("Name Server2: {}", or_unset(info.dns_secondary));
            info!("~~~~~~~~~~~~~~");

            events.set(Conditions::CONNECTED);
        }
        Notification::Ip(IpEvent::LostIp { netif }) => {
            info!("{netif}: modem disconnected from PPP server");
        }
        Notification::Ip(ev @ IpEvent::GotIpv6 { .. }) => info!("{ev}"),
        Notification::Ppp(PppEvent::UserInterrupted { netif }) => {
            info!("user interrupted event from netif {netif}");
        }
        Notification::Ppp(ev) => info!("PPP state changed: {ev}"),
        Notification::Terminal(TerminalError::DeviceGone) => {
            info!("modem device disconnected");
            events.set(Conditions::DEVICE_DISCONNECTED);
        }
        // the session is still usable, a disconnect would show up as DeviceGone
        Notification::Terminal(err) => warn!("terminal error from transport: {err}"),
    }
}
