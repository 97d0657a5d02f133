use super::{Transport, DISCOVERY_BACKOFF, DISCOVERY_TIMEOUT};
use crate::{
    profile::DeviceProfile,
    session::{
        mmcli::{self, DataLink, Locator, MmcliSession},
        LinkSession, TerminalSlot,
    },
    utils::retry_for,
};
use async_trait::async_trait;
use color_eyre::{eyre::WrapErr, Result};
use nusb::MaybeFuture;
use pppos_connd_events::TerminalError;
use std::time::Duration;
use tokio::{
    task::{self, JoinHandle},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbConfig {
    pub vid: u16,
    pub pid: u16,
    /// Interface carrying the command channel.
    pub interface: u8,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            vid: 0x1e0e,
            pid: 0x9206,
            interface: 2,
        }
    }
}

impl UsbConfig {
    pub fn matches(&self, vid: u16, pid: u16, mut interfaces: impl Iterator<Item = u8>) -> bool {
        vid == self.vid && pid == self.pid && interfaces.any(|i| i == self.interface)
    }
}

/// Hot-plug link. Every [`Transport::open`] waits for the device to be
/// plugged in, and the session reports [`TerminalError::DeviceGone`] once it
/// is pulled.
pub struct UsbTransport {
    usb: UsbConfig,
    profile: DeviceProfile,
    link: DataLink,
    poll_interval: Duration,
    settle: Duration,
}

impl UsbTransport {
    pub fn new(
        usb: UsbConfig,
        profile: DeviceProfile,
        link: DataLink,
        poll_interval: Duration,
    ) -> Self {
        Self {
            usb,
            profile,
            link,
            poll_interval,
            settle: Duration::from_millis(1000),
        }
    }
}

#[async_trait]
impl Transport for UsbTransport {
    fn monitors_disconnect(&self) -> bool {
        true
    }

    async fn open(&mut self) -> Result<Box<dyn LinkSession>> {
        let UsbConfig {
            vid,
            pid,
            interface,
        } = self.usb;
        info!(
            "initializing {} modem over usb {vid:04x}:{pid:04x} interface {interface}",
            self.profile
        );

        info!("waiting for usb device connection...");
        let device = loop {
            if let Some(device) = find_device(self.usb).await? {
                break device;
            }
            time::sleep(self.poll_interval).await;
        };
        info!("usb device {device} connected, waiting for it to settle");
        time::sleep(self.settle).await;

        let profile = self.profile;
        let modem = retry_for(DISCOVERY_TIMEOUT, DISCOVERY_BACKOFF, || {
            mmcli::find_modem(profile, Locator::UsbDevice(device.as_str()))
        })
        .await?;

        let session = MmcliSession::new(modem, self.link.clone());
        spawn_presence_watcher(
            self.usb,
            self.poll_interval,
            session.terminal_slot(),
            session.cancel_token(),
        );

        Ok(Box::new(session))
    }
}

/// sysfs name (`1-1.2`) of the first attached device matching `usb`.
async fn find_device(usb: UsbConfig) -> Result<Option<String>> {
    task::spawn_blocking(move || -> Result<Option<String>> {
        let device = nusb::list_devices()
            .wait()
            .wrap_err("failed to enumerate usb devices")?
            .filter(|d| {
                usb.matches(
                    d.vendor_id(),
                    d.product_id(),
                    d.interfaces().map(|i| i.interface_number()),
                )
            })
            .find_map(|d| {
                d.sysfs_path()
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            });

        Ok(device)
    })
    .await
    .wrap_err("usb enumeration task panicked")?
}

/// Polls for the device until it is gone or `cancel` fires. A failed
/// enumeration is not taken as a removal.
fn spawn_presence_watcher(
    usb: UsbConfig,
    poll_interval: Duration,
    terminal: TerminalSlot,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    task::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = time::sleep(poll_interval) => {}
            }

            match find_device(usb).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    info!("usb device {:04x}:{:04x} removed", usb.vid, usb.pid);
                    // kept by the slot until the session registers a handler
                    terminal.fire(TerminalError::DeviceGone);
                    return;
                }
                Err(e) => warn!("failed to poll usb devices: {e}"),
            }
        }
    })
}
