use crate::config::reliability::ReliabilityConfig;
use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url", with = "serde_url")]
    pub url: Url,
    #[serde(default, with = "serde_url_vec")]
    pub fallback_urls: Vec<Url>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connection_pool_size")]
    pub connection_pool_size: usize,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
}

impl UpstreamConfig {
    /// Primary URL first, then the fallbacks in order.
    pub fn urls(&self) -> impl Iterator<Item = &Url> {
        std::iter::once(&self.url).chain(self.fallback_urls.iter())
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            fallback_urls: Vec::new(),
            timeout_secs: default_timeout_secs(),
            connection_pool_size: default_connection_pool_size(),
            reliability: ReliabilityConfig::default(),
        }
    }
}

fn default_upstream_url() -> Url {
    Url::parse("https://registry.npmjs.org/").expect("default upstream url is valid")
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connection_pool_size() -> usize {
    64
}

mod serde_url {
    use serde::{Deserialize, Deserializer};
    use url::Url;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Url, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Url::parse(&s).map_err(serde::de::Error::custom)
    }
}

mod serde_url_vec {
    use serde::{Deserialize, Deserializer};
    use url::Url;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Url>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let list = Vec::<String>::deserialize(deserializer)?;
        list.into_iter()
            .map(|s| Url::parse(&s).map_err(serde::de::Error::custom))
            .collect()
    }
}
