use super::{Transport, DISCOVERY_BACKOFF, DISCOVERY_TIMEOUT};
use crate::{
    profile::DeviceProfile,
    session::{
        mmcli::{self, DataLink, Locator, MmcliSession},
        LinkSession,
    },
    utils::retry_for,
};
use async_trait::async_trait;
use clap::ValueEnum;
use color_eyre::{eyre::WrapErr, Result};
use derive_more::Display;
use tracing::info;

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FlowControl {
    #[default]
    #[display("none")]
    None,
    #[display("software")]
    #[value(name = "sw")]
    Software,
    #[display("hardware")]
    #[value(name = "hw")]
    Hardware,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UartConfig {
    pub port: String,
    pub baud: u32,
    pub flow_control: FlowControl,
}

/// Fixed-wire link. The modem is soldered on, so it is never reported gone.
pub struct UartTransport {
    uart: UartConfig,
    profile: DeviceProfile,
    link: DataLink,
}

impl UartTransport {
    /// pppd runs with the line settings of `uart`, whatever `link` says.
    pub fn new(uart: UartConfig, profile: DeviceProfile, mut link: DataLink) -> Self {
        link.ppp.baud = Some(uart.baud);
        link.ppp.flow_control = uart.flow_control;

        Self {
            uart,
            profile,
            link,
        }
    }
}

#[async_trait]
impl Transport for UartTransport {
    fn monitors_disconnect(&self) -> bool {
        false
    }

    async fn open(&mut self) -> Result<Box<dyn LinkSession>> {
        let UartConfig {
            port,
            baud,
            flow_control,
        } = &self.uart;
        info!(
            "initializing {} modem on {port} ({baud} baud, {flow_control} flow control)",
            self.profile
        );

        let profile = self.profile;
        let modem = retry_for(DISCOVERY_TIMEOUT, DISCOVERY_BACKOFF, || {
            mmcli::find_modem(profile, Locator::Port(port.as_str()))
        })
        .await?;

        let mut session = MmcliSession::new(modem, self.link.clone());

        if *flow_control == FlowControl::Hardware {
            session
                .set_hw_flow_control()
                .await
                .wrap_err("failed to set hardware flow control")?;
            info!("hardware flow control enabled");
        }

        Ok(Box::new(session))
    }
}
