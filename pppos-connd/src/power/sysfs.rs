use super::{Level, Line, PowerControl};
use async_trait::async_trait;
use color_eyre::{eyre::WrapErr, Result};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::debug;

/// [`PowerControl`] over the legacy `/sys/class/gpio` interface.
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    root: PathBuf,
    supply_enable: u32,
    power_key: u32,
}

impl SysfsGpio {
    pub fn new(sysfs: impl AsRef<Path>, supply_enable: u32, power_key: u32) -> Self {
        Self {
            root: sysfs.as_ref().join("class").join("gpio"),
            supply_enable,
            power_key,
        }
    }

    fn pin(&self, line: Line) -> u32 {
        match line {
            Line::SupplyEnable => self.supply_enable,
            Line::PowerKey => self.power_key,
        }
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    async fn export(&self, pin: u32) -> Result<()> {
        if fs::metadata(self.pin_dir(pin)).await.is_ok() {
            debug!("gpio{pin} already exported");
            return Ok(());
        }

        fs::write(self.root.join("export"), pin.to_string())
            .await
            .wrap_err_with(|| format!("failed to export gpio{pin}"))
    }

    async fn write_attr(&self, pin: u32, attr: &str, value: &str) -> Result<()> {
        fs::write(self.pin_dir(pin).join(attr), value)
            .await
            .wrap_err_with(|| format!("failed to write {value} to gpio{pin}/{attr}"))
    }
}

#[async_trait]
impl PowerControl for SysfsGpio {
    async fn configure(&mut self) -> Result<()> {
        for pin in [self.supply_enable, self.power_key] {
            self.export(pin).await?;
            self.write_attr(pin, "direction", "out").await?;

            // not every gpio controller supports interrupts
            match fs::write(self.pin_dir(pin).join("edge"), "none").await {
                Err(e) if e.kind() != ErrorKind::NotFound => {
                    return Err(e)
                        .wrap_err_with(|| format!("failed to disable edge on gpio{pin}"));
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn set_line(&mut self, line: Line, level: Level) -> Result<()> {
        let value = match level {
            Level::High => "1",
            Level::Low => "0",
        };

        self.write_attr(self.pin(line), "value", value).await
    }
}
