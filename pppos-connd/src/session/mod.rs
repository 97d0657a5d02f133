pub mod mmcli;

use async_trait::async_trait;
use color_eyre::Result;
use derive_more::Display;
use pppos_connd_events::TerminalError;
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    #[display("command")]
    Command,
    #[display("data")]
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinStatus {
    Ready,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SignalQuality {
    /// dBm
    pub rssi: Option<f64>,
    /// Bit error rate, in percent.
    pub ber: Option<f64>,
}

impl fmt::Display for SignalQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rssi {
            Some(rssi) => write!(f, "rssi={rssi}dBm")?,
            None => write!(f, "rssi=--")?,
        }
        match self.ber {
            Some(ber) => write!(f, ", ber={ber}%"),
            None => write!(f, ", ber=--"),
        }
    }
}

pub type TerminalErrorHandler = Arc<dyn Fn(TerminalError) + Send + Sync>;

/// Command channel to one attached modem.
///
/// Every method except [`LinkSession::on_terminal_error`] talks to the device
/// and may fail. `destroy` takes the session down; the caller drops it right
/// after, so it can never be destroyed twice.
#[async_trait]
pub trait LinkSession: Send {
    async fn read_pin_status(&mut self) -> Result<PinStatus>;

    async fn set_pin(&mut self, pin: &str) -> Result<()>;

    async fn signal_quality(&mut self) -> Result<SignalQuality>;

    async fn send_sms(&mut self, recipient: &str, text: &str) -> Result<()>;

    async fn set_mode(&mut self, mode: LinkMode) -> Result<()>;

    /// Subscriber identity of the inserted SIM.
    async fn imsi(&mut self) -> Result<String>;

    /// Registers the callback invoked when the device goes away. Replaces any
    /// previous handler.
    fn on_terminal_error(&mut self, handler: TerminalErrorHandler);

    async fn destroy(&mut self) -> Result<()>;
}

/// Holds the terminal error handler of a session so that a background watcher
/// can fire it. An error fired before a handler is registered is kept and
/// delivered to the first handler set.
#[derive(Clone, Default)]
pub struct TerminalSlot(Arc<Mutex<SlotState>>);

#[derive(Default)]
struct SlotState {
    handler: Option<TerminalErrorHandler>,
    pending: Option<TerminalError>,
}

impl TerminalSlot {
    pub fn set(&self, handler: TerminalErrorHandler) {
        let pending = {
            let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            state.handler = Some(handler.clone());
            state.pending.take()
        };

        if let Some(err) = pending {
            handler(err);
        }
    }

    /// Invokes the handler, or keeps `err` until one is set. Returns whether
    /// a handler was invoked.
    pub fn fire(&self, err: TerminalError) -> bool {
        let handler = {
            let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            if state.handler.is_none() {
                state.pending = Some(err);
            }
            state.handler.clone()
        };

        match handler {
            Some(handler) => {
                handler(err);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for TerminalSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("TerminalSlot")
            .field("registered", &state.handler.is_some())
            .field("pending", &state.pending)
            .finish()
    }
}
