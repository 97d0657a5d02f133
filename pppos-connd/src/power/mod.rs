pub mod sysfs;

use async_trait::async_trait;
use color_eyre::{eyre::WrapErr, Result};
use derive_more::Display;
use std::time::Duration;
use tokio::time;
use tracing::info;

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Line {
    /// Active low: driving it high cuts the modem supply.
    #[display("supply-enable")]
    SupplyEnable,
    #[display("power-key")]
    PowerKey,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    #[display("high")]
    High,
    #[display("low")]
    Low,
}

/// Two digital outputs wired to the modem.
#[async_trait]
pub trait PowerControl: Send + Sync {
    /// Puts both lines in output mode with edge interrupts disabled.
    async fn configure(&mut self) -> Result<()>;

    async fn set_line(&mut self, line: Line, level: Level) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerTimings {
    pub supply_off: Duration,
    pub supply_settle: Duration,
    pub key_press: Duration,
    pub boot: Duration,
}

impl Default for PowerTimings {
    fn default() -> Self {
        Self {
            supply_off: Duration::from_millis(1000),
            supply_settle: Duration::from_millis(1000),
            key_press: Duration::from_millis(200),
            boot: Duration::from_millis(2000),
        }
    }
}

pub struct PowerSequencer {
    control: Box<dyn PowerControl>,
    timings: PowerTimings,
}

impl PowerSequencer {
    pub fn new(control: impl PowerControl + 'static, timings: PowerTimings) -> Self {
        Self {
            control: Box::new(control),
            timings,
        }
    }

    pub async fn configure(&mut self) -> Result<()> {
        self.control
            .configure()
            .await
            .wrap_err("failed to configure modem power lines")
    }

    /// Power-cycles the modem and presses its power key. Not idempotent, a
    /// second call cycles the modem again.
    pub async fn wake_up(&mut self) -> Result<()> {
        let PowerTimings {
            supply_off,
            supply_settle,
            key_press,
            boot,
        } = self.timings;

        info!("modem supply power off");
        self.set(Line::SupplyEnable, Level::High).await?;
        time::sleep(supply_off).await;

        info!("modem supply power on");
        self.set(Line::SupplyEnable, Level::Low).await?;
        time::sleep(supply_settle).await;

        info!("pressing modem power key");
        self.set(Line::PowerKey, Level::High).await?;
        time::sleep(key_press).await;
        self.set(Line::PowerKey, Level::Low).await?;
        time::sleep(boot).await;

        Ok(())
    }

    async fn set(&mut self, line: Line, level: Level) -> Result<()> {
        self.control
            .set_line(line, level)
            .await
            .wrap_err_with(|| format!("failed to drive {line} {level}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::eyre;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    type Calls = Arc<Mutex<Vec<(Line, Level, Duration)>>>;

    struct Recorder {
        start: Instant,
        calls: Calls,
        fail_on: Option<Line>,
    }

    #[async_trait]
    impl PowerControl for Recorder {
        async fn configure(&mut self) -> Result<()> {
            Ok(())
        }

        async fn set_line(&mut self, line: Line, level: Level) -> Result<()> {
            if self.fail_on == Some(line) {
                return Err(eyre!("gpio write failed"));
            }
            self.calls
                .lock()
                .unwrap()
                .push((line, level, self.start.elapsed()));
            Ok(())
        }
    }

    fn sequencer(fail_on: Option<Line>) -> (PowerSequencer, Calls) {
        let calls = Calls::default();
        let recorder = Recorder {
            start: Instant::now(),
            calls: calls.clone(),
            fail_on,
        };

        (PowerSequencer::new(recorder, PowerTimings::default()), calls)
    }

    #[tokio::test(start_paused = true)]
    async fn wake_up_drives_lines_in_order_with_delays() {
        let (mut seq, calls) = sequencer(None);
        let start = Instant::now();

        seq.wake_up().await.unwrap();

        let ms = Duration::from_millis;
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                (Line::SupplyEnable, Level::High, ms(0)),
                (Line::SupplyEnable, Level::Low, ms(1000)),
                (Line::PowerKey, Level::High, ms(2000)),
                (Line::PowerKey, Level::Low, ms(2200)),
            ]
        );
        assert_eq!(start.elapsed(), ms(4200));
    }

    #[tokio::test(start_paused = true)]
    async fn wake_up_stops_at_first_failed_write() {
        let (mut seq, calls) = sequencer(Some(Line::PowerKey));

        let err = seq.wake_up().await.unwrap_err();

        assert_eq!(err.to_string(), "failed to drive power-key high");
        assert_eq!(calls.lock().unwrap().len(), 2);
    }
}
