/**
 * CONFIGURATION - Paramètres du coordinateur de partage de charge
 *
 * Fichier YAML (LOADSHARE_CONFIG, défaut: loadshare.yaml). Tous les champs
 * ont une valeur par défaut : un fichier absent ou invalide donne la config
 * par défaut, jamais un crash.
 */

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{error, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("safety_factor must be in (0, 1], got {0}")]
    SafetyFactor(f64),
    #[error("{0} must not be negative")]
    NegativeCurrent(&'static str),
    #[error("{0} must be a finite number")]
    NotFinite(&'static str),
    #[error("discovery.poll_wait_ms ({wait}) must be shorter than discovery.poll_interval_ms ({interval})")]
    PollWait { wait: u64, interval: u64 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("discovery.collect_window_ms ({window}) must be shorter than discovery.query_timeout_ms ({timeout})")]
    CollectWindow { window: u64, timeout: u64 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadShareConfig {
    #[serde(default)]
    pub group: GroupConf,
    #[serde(default)]
    pub discovery: DiscoveryConf,
    #[serde(default)]
    pub storage: StorageConf,
    #[serde(default)]
    pub local: LocalConf,
    #[serde(default)]
    pub http: HttpConf,
    #[serde(default)]
    pub status: StatusConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConf {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub group_id: String,
    /// Calibre du circuit partagé (A)
    #[serde(default = "default_max_current")]
    pub max_current: f64,
    #[serde(default = "default_safety_factor")]
    pub safety_factor: f64,
    /// Courant de repli de l'unité locale en failsafe
    #[serde(default)]
    pub failsafe_current: f64,
    /// Plancher par pair quand les configs divergent
    #[serde(default = "default_mismatch_current")]
    pub mismatch_current: f64,
    #[serde(default = "default_failsafe_missed_ticks")]
    pub failsafe_missed_ticks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConf {
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Réveil de la tâche coordinateur
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Intervalle minimum entre deux nouvelles requêtes
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Attente max d'un poll de la primitive (ne doit jamais bloquer le tick)
    #[serde(default = "default_poll_wait_ms")]
    pub poll_wait_ms: u64,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    /// Fenêtre de collecte des réponses mDNS avant de rendre le résultat
    #[serde(default = "default_collect_window_ms")]
    pub collect_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConf {
    #[serde(default = "default_peers_file")]
    pub peers_file: String,
}

/// Identité de l'unité qui exécute ce coordinateur
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConf {
    #[serde(default = "default_local_id")]
    pub id: String,
    /// Hostname (ex: "openevse-a7d4.local") ; vide = inconnu
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub config_version: u32,
    #[serde(default)]
    pub config_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConf {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConf {
    #[serde(default = "default_status_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_status_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_max_current() -> f64 { 32.0 }
fn default_safety_factor() -> f64 { 1.0 }
fn default_mismatch_current() -> f64 { 6.0 }
fn default_failsafe_missed_ticks() -> u32 { 3 }
fn default_service() -> String { "openevse".into() }
fn default_protocol() -> String { "tcp".into() }
fn default_max_results() -> usize { 20 }
fn default_poll_interval_ms() -> u64 { 2_000 }
fn default_discovery_interval_ms() -> u64 { 10_000 }
fn default_query_timeout_ms() -> u64 { 5_000 }
fn default_poll_wait_ms() -> u64 { 100 }
fn default_cache_ttl_ms() -> u64 { 60_000 }
fn default_collect_window_ms() -> u64 { 3_000 }
fn default_peers_file() -> String { "./data/loadsharing_peers.json".into() }
fn default_local_id() -> String { "local".into() }
fn default_bind() -> String { "0.0.0.0:8080".into() }
fn default_status_poll_ms() -> u64 { 5_000 }
fn default_status_timeout_ms() -> u64 { 1_500 }

impl Default for GroupConf {
    fn default() -> Self {
        Self {
            enabled: false,
            group_id: String::new(),
            max_current: default_max_current(),
            safety_factor: default_safety_factor(),
            failsafe_current: 0.0,
            mismatch_current: default_mismatch_current(),
            failsafe_missed_ticks: default_failsafe_missed_ticks(),
        }
    }
}

impl GroupConf {
    pub fn budget(&self) -> f64 {
        self.max_current * self.safety_factor
    }
}

impl Default for DiscoveryConf {
    fn default() -> Self {
        Self {
            service: default_service(),
            protocol: default_protocol(),
            max_results: default_max_results(),
            poll_interval_ms: default_poll_interval_ms(),
            discovery_interval_ms: default_discovery_interval_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            poll_wait_ms: default_poll_wait_ms(),
            cache_ttl_ms: default_cache_ttl_ms(),
            collect_window_ms: default_collect_window_ms(),
        }
    }
}

impl DiscoveryConf {
    pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_ms) }
    pub fn discovery_interval(&self) -> Duration { Duration::from_millis(self.discovery_interval_ms) }
    pub fn query_timeout(&self) -> Duration { Duration::from_millis(self.query_timeout_ms) }
    pub fn poll_wait(&self) -> Duration { Duration::from_millis(self.poll_wait_ms) }
    pub fn cache_ttl(&self) -> Duration { Duration::from_millis(self.cache_ttl_ms) }
    pub fn collect_window(&self) -> Duration { Duration::from_millis(self.collect_window_ms) }
}

impl Default for StorageConf {
    fn default() -> Self {
        Self { peers_file: default_peers_file() }
    }
}

impl Default for LocalConf {
    fn default() -> Self {
        Self {
            id: default_local_id(),
            host: String::new(),
            config_version: 0,
            config_hash: String::new(),
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

impl Default for StatusConf {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_status_poll_ms(),
            request_timeout_ms: default_status_timeout_ms(),
        }
    }
}

impl LoadShareConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.group;
        if !(g.safety_factor > 0.0 && g.safety_factor <= 1.0) {
            return Err(ConfigError::SafetyFactor(g.safety_factor));
        }
        for (name, value) in [
            ("group.max_current", g.max_current),
            ("group.failsafe_current", g.failsafe_current),
            ("group.mismatch_current", g.mismatch_current),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::NotFinite(name));
            }
            if value < 0.0 {
                return Err(ConfigError::NegativeCurrent(name));
            }
        }

        let d = &self.discovery;
        if d.max_results == 0 {
            return Err(ConfigError::Zero("discovery.max_results"));
        }
        for (name, value) in [
            ("discovery.poll_interval_ms", d.poll_interval_ms),
            ("discovery.discovery_interval_ms", d.discovery_interval_ms),
            ("discovery.query_timeout_ms", d.query_timeout_ms),
            ("discovery.cache_ttl_ms", d.cache_ttl_ms),
            ("status.poll_interval_ms", self.status.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        // le poll de la primitive ne doit jamais bloquer un tick entier
        if d.poll_wait_ms >= d.poll_interval_ms {
            return Err(ConfigError::PollWait {
                wait: d.poll_wait_ms,
                interval: d.poll_interval_ms,
            });
        }
        if d.collect_window_ms >= d.query_timeout_ms {
            return Err(ConfigError::CollectWindow {
                window: d.collect_window_ms,
                timeout: d.query_timeout_ms,
            });
        }
        Ok(())
    }
}

pub fn parse_config(txt: &str) -> Result<LoadShareConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(LoadShareConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> LoadShareConfig {
    let path = std::env::var("LOADSHARE_CONFIG").unwrap_or_else(|_| "loadshare.yaml".into());
    if !Path::new(&path).exists() {
        warn!(path = %path, "no config file, using defaults");
        return LoadShareConfig::default();
    }

    let txt = fs::read_to_string(&path).await.unwrap_or_default();
    let cfg = match parse_config(&txt) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %path, error = %e, "invalid config, using defaults");
            return LoadShareConfig::default();
        }
    };

    match cfg.validate() {
        Ok(()) => cfg,
        Err(e) => {
            error!(path = %path, error = %e, "config rejected, using defaults");
            LoadShareConfig::default()
        }
    }
}
