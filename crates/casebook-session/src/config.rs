use std::time::Duration;

use casebook_api::ApiConfig;
use serde::Deserialize;

use crate::state::FLOWS_PAGE_SIZE;

pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_flows_page_size")]
    pub flows_page_size: usize,
    #[serde(default = "default_error_channel_capacity")]
    pub error_channel_capacity: usize,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: default_polling_interval_ms(),
            flows_page_size: default_flows_page_size(),
            error_channel_capacity: default_error_channel_capacity(),
            event_channel_capacity: default_event_channel_capacity(),
            api_base_url: None,
            api_token: None,
        }
    }
}

impl SyncConfig {
    /// Reads `CASEBOOK_*` variables, e.g. `CASEBOOK_POLLING_INTERVAL_MS`.
    pub fn from_env() -> Self {
        Self::from_source(Self::environment())
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("CASEBOOK")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    pub fn from_source<S>(source: S) -> Self
    where
        S: config::Source + Send + Sync + 'static,
    {
        config::Config::builder()
            .add_source(source)
            .build()
            .and_then(|c| c.try_deserialize())
            .map(SyncConfig::normalize)
            .unwrap_or_else(|_| SyncConfig::default().normalize())
    }

    fn normalize(mut self) -> Self {
        self.api_base_url = Self::normalize_opt(self.api_base_url.take());
        self.api_token = Self::normalize_opt(self.api_token.take());
        // Broadcast channels reject a zero capacity.
        self.error_channel_capacity = self.error_channel_capacity.max(1);
        self.event_channel_capacity = self.event_channel_capacity.max(1);
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// `None` until a base URL is configured.
    pub fn api_config(&self) -> Option<ApiConfig> {
        self.api_base_url.as_ref().map(|base_url| ApiConfig {
            base_url: base_url.clone(),
            token: self.api_token.clone(),
        })
    }
}

fn default_polling_interval_ms() -> u64 {
    DEFAULT_POLLING_INTERVAL.as_millis() as u64
}

fn default_flows_page_size() -> usize {
    FLOWS_PAGE_SIZE
}

fn default_error_channel_capacity() -> usize {
    64
}

fn default_event_channel_capacity() -> usize {
    256
}
