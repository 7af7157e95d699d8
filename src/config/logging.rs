use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` wins when set.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    pub fn filter_directive(&self) -> String {
        let level = self.level.trim();
        if level.is_empty() {
            Self::default_level()
        } else {
            level.to_string()
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LoggingConfig::default_level(),
            json: false,
        }
    }
}
