//! Standardized telemetry for pppos-connd.
//!
//! Start with [`TelemetryConfig::new()`], then call [`TelemetryConfig::init()`]
//! once at the beginning of `main` and [`TelemetryFlusher::flush()`] at the end.

use std::io::{IsTerminal as _, Write as _};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    filter::{Directive, ParseError},
    layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
    EnvFilter,
};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid filter directive {directive:?}: {source}")]
    Directive {
        directive: String,
        #[source]
        source: ParseError,
    },
    #[error(transparent)]
    Init(#[from] TryInitError),
}

/// The toplevel config for the pppos-telemetry crate. Start here.
#[derive(Debug)]
pub struct TelemetryConfig {
    syslog_identifier: Option<String>,
    global_filter: EnvFilter,
    quiet_targets: Vec<String>,
}

impl TelemetryConfig {
    #[expect(clippy::new_without_default, reason = "may add required args later")]
    #[must_use]
    pub fn new() -> Self {
        Self {
            syslog_identifier: None,
            global_filter: EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
            quiet_targets: Vec::new(),
        }
    }

    /// Enables journald, and uses the provided syslog identifier.
    ///
    /// If you run the application in a tty, stderr will be used instead.
    #[must_use]
    pub fn with_journald(self, syslog_identifier: &str) -> Self {
        Self {
            syslog_identifier: Some(syslog_identifier.to_owned()),
            ..self
        }
    }

    /// Caps `target` at WARN unless `RUST_LOG` is set.
    ///
    /// Used for chatty transport crates (mqtt event loops and the like) that
    /// would otherwise drown the phase transitions at INFO.
    #[must_use]
    pub fn with_quiet_target(mut self, target: &str) -> Self {
        self.quiet_targets.push(target.to_owned());
        self
    }

    pub fn try_init(self) -> Result<TelemetryFlusher, TelemetryError> {
        let mut global_filter = self.global_filter;
        if std::env::var_os(EnvFilter::DEFAULT_ENV).is_none() {
            for target in self.quiet_targets {
                let directive = format!("{target}=warn");
                let parsed: Directive = directive
                    .parse()
                    .map_err(|source| TelemetryError::Directive {
                        directive: directive.clone(),
                        source,
                    })?;
                global_filter = global_filter.add_directive(parsed);
            }
        }

        let registry = tracing_subscriber::registry();
        // The type is only there to get it to compile.
        let tokio_console_layer: Option<tracing_subscriber::layer::Identity> = None;
        #[cfg(tokio_unstable)]
        let tokio_console_layer = console_subscriber::spawn();
        // Checking for a terminal helps detect if we are running under systemd.
        let journald_layer = if !std::io::stderr().is_terminal() {
            self.syslog_identifier.and_then(|syslog_identifier| {
                tracing_journald::layer()
                    .inspect_err(|err| {
                        eprintln!(
                            "failed connecting to journald socket. \
                        will write to stderr: {err}"
                        );
                    })
                    .map(|layer| layer.with_syslog_identifier(syslog_identifier))
                    .ok()
            })
        } else {
            None
        };
        let stderr_layer = journald_layer
            .is_none()
            .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
        assert!(stderr_layer.is_some() || journald_layer.is_some());

        registry
            .with(tokio_console_layer)
            .with(stderr_layer)
            .with(journald_layer)
            .with(global_filter)
            .try_init()?;

        Ok(TelemetryFlusher { _priv: () })
    }

    /// Initializes the telemetry config. Call this only once, at the beginning of the
    /// program.
    ///
    /// Calling this more than once or when another tracing subscriber is registered
    /// will cause a panic.
    pub fn init(self) -> TelemetryFlusher {
        self.try_init().expect("failed to initialize pppos-telemetry")
    }
}

/// Allows flushing all telemetry logs.
#[must_use = "call .flush at the end of the program, otherwise logs may get lost"]
pub struct TelemetryFlusher {
    _priv: (),
}

impl TelemetryFlusher {
    /// Call this at the end of the program.
    pub fn flush(self) {
        std::io::stderr().flush().ok();
        std::io::stdout().flush().ok();
    }
}

