//! How the daemon reaches the modem.
//!
//! A transport decides whether a session has to wait for the device to show
//! up and whether the device can disappear while in use. The orchestrator
//! runs the same phase machine over either kind.

pub mod uart;
pub mod usb;

use crate::session::LinkSession;
use async_trait::async_trait;
use color_eyre::Result;
use std::time::Duration;

pub use uart::{FlowControl, UartConfig, UartTransport};
pub use usb::{UsbConfig, UsbTransport};

/// How long to keep asking ModemManager for the modem after the device
/// appeared.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DISCOVERY_BACKOFF: Duration = Duration::from_secs(2);

#[async_trait]
pub trait Transport: Send + Sync {
    /// True if the device can be unplugged and plugged back in, in which case
    /// sessions report [`pppos_connd_events::TerminalError::DeviceGone`] and
    /// the orchestrator keeps opening new ones.
    fn monitors_disconnect(&self) -> bool;

    /// Waits for the device if needed and opens a command session on it.
    async fn open(&mut self) -> Result<Box<dyn LinkSession>>;
}
