use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Public URL clients reach the registry at. Tarball references in
    /// served documents are prefixed with it; when unset they stay relative
    /// to the request host.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Mounts the registry under `/{path_prefix}`.
    #[serde(default)]
    pub path_prefix: Option<String>,
}

impl ServerConfig {
    pub fn public_base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }

    /// `path_prefix` without surrounding slashes, `None` when empty.
    pub fn mount_prefix(&self) -> Option<&str> {
        self.path_prefix
            .as_deref()
            .map(|prefix| prefix.trim_matches('/'))
            .filter(|prefix| !prefix.is_empty())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
            base_url: None,
            path_prefix: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8346
}

fn default_workers() -> usize {
    num_cpus::get()
}
