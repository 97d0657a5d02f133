pub mod mqtt;

use crate::event_group::EventGroup;
use async_trait::async_trait;
use color_eyre::Result;

pub use mqtt::MqttProbe;

/// Proves that application traffic makes it over the data link by setting
/// [`crate::event_group::Conditions::GOT_DATA`] once data comes back.
#[async_trait]
pub trait TrafficProbe: Send + Sync {
    async fn start(&mut self, events: EventGroup) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;
}
