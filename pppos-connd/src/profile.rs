use clap::ValueEnum;
use derive_more::Display;

/// Supported modem families. Used to pick the right device when more than one
/// modem is attached.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DeviceProfile {
    #[default]
    #[display("generic")]
    Generic,
    #[display("BG96")]
    Bg96,
    #[display("SIM800")]
    Sim800,
    #[display("SIM7000")]
    Sim7000,
    #[display("SIM7070")]
    Sim7070,
    #[display("SIM7600")]
    Sim7600,
}

impl DeviceProfile {
    /// Substring expected in the model string a modem reports.
    pub fn model_hint(self) -> Option<&'static str> {
        match self {
            DeviceProfile::Generic => None,
            DeviceProfile::Bg96 => Some("BG96"),
            DeviceProfile::Sim800 => Some("SIM800"),
            DeviceProfile::Sim7000 => Some("SIM7000"),
            DeviceProfile::Sim7070 => Some("SIM7070"),
            DeviceProfile::Sim7600 => Some("SIM7600"),
        }
    }

    pub fn matches_model(self, model: &str) -> bool {
        self.model_hint()
            .is_none_or(|hint| model.to_ascii_uppercase().contains(hint))
    }
}
