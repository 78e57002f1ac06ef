//! Runtime configuration.
//!
//! Values are layered with Figment: compiled defaults, then an optional
//! `room-coordinator.toml` (path overridable with `ROOM_CONFIG`), then
//! `ROOM_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::room::RoomMode;

pub const DEFAULT_CONFIG_FILE: &str = "room-coordinator.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub static_dir: PathBuf,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,

    /// Timer value given to a room when it is first created.
    pub default_timer_secs: u64,
    pub standard_capacity: usize,
    pub queue_capacity: usize,

    pub scratch_dir: PathBuf,
    pub upload_idle_timeout_secs: u64,
    pub upload_sweep_interval_secs: u64,
    /// Lowercase file-name suffixes that are never forwarded.
    pub denied_extensions: Vec<String>,

    pub api_base_url: String,
    pub save_path: String,
    pub upload_path: String,
    pub transaction_path: String,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            static_dir: PathBuf::from("public"),
            tls_cert: None,
            tls_key: None,
            default_timer_secs: 600,
            standard_capacity: 4,
            queue_capacity: 2,
            scratch_dir: PathBuf::from("upload_chunks"),
            upload_idle_timeout_secs: 15 * 60,
            upload_sweep_interval_secs: 60,
            denied_extensions: vec![".exe".to_string()],
            api_base_url: "https://api.nollywoodfilmmaker.com/api".to_string(),
            save_path: "/chat/save".to_string(),
            upload_path: "/chat/upload".to_string(),
            transaction_path: "/users/gettranstat".to_string(),
            request_timeout_secs: 60,
        }
    }
}

impl Config {
    /// Load from the default file location with env overrides.
    pub fn load() -> Result<Self, figment::Error> {
        let path = std::env::var("ROOM_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::figment(Toml::file(path)).extract()
    }

    /// Load from an in-memory TOML document, without env overrides.
    #[cfg(test)]
    fn from_toml_str(toml: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(toml))
            .extract()
    }

    fn figment(file: figment::providers::Data<Toml>) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(file)
            .merge(Env::prefixed("ROOM_").ignore(&["config"]))
    }

    pub fn capacity(&self, mode: RoomMode) -> usize {
        match mode {
            RoomMode::Standard => self.standard_capacity,
            RoomMode::Queue => self.queue_capacity,
        }
    }

    pub fn upload_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_idle_timeout_secs)
    }

    pub fn upload_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.upload_sweep_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn tls_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }

    /// Joins the base URL and an endpoint path with exactly one slash.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
