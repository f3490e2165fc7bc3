/**
 * STATUTS DES PAIRS - État de charge en direct de chaque unité
 *
 * FONCTIONNEMENT :
 * Le coordinateur lit les statuts de façon synchrone via un `StatusSource`
 * pendant son tick. Dans le binaire la source est un `StatusBoard` qu'un
 * `StatusPoller` en tâche de fond remplit par HTTP.
 */

use crate::models::{GroupState, Peer, PeerStatus};
use crate::state::{new_state, Shared};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("no status for peer {0}")]
    Unavailable(String),
    #[error("status request to {host} failed: {source}")]
    Request {
        host: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("status request to {host} returned HTTP {code}")]
    Http { host: String, code: u16 },
}

/// Fournit le statut d'un pair à la demande (par id)
pub trait StatusSource: Send + Sync {
    fn peer_status(&self, peer: &Peer) -> Result<PeerStatus, StatusError>;
}

/// Derniers statuts connus, par id de pair
#[derive(Clone, Default)]
pub struct StatusBoard {
    entries: Shared<HashMap<String, PeerStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            entries: new_state(HashMap::new()),
        }
    }

    pub fn update(&self, id: &str, status: PeerStatus) {
        self.entries.lock().insert(id.to_string(), status);
    }

    pub fn evict(&self, id: &str) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<PeerStatus> {
        self.entries.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StatusSource for StatusBoard {
    fn peer_status(&self, peer: &Peer) -> Result<PeerStatus, StatusError> {
        self.get(&peer.id)
            .ok_or_else(|| StatusError::Unavailable(peer.id.clone()))
    }
}

fn flag<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    let value = serde_json::Value::deserialize(de)?;
    Ok(match value {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    })
}

/// Corps de `GET http://<host>/status` sur une unité
#[derive(Debug, Deserialize)]
struct WireStatus {
    #[serde(default)]
    amp: f64,
    #[serde(default)]
    voltage: f64,
    #[serde(default)]
    pilot: f64,
    #[serde(default, deserialize_with = "flag")]
    vehicle: bool,
    #[serde(default)]
    state: u8,
    #[serde(default)]
    config_version: u32,
    #[serde(default)]
    config_hash: String,
    #[serde(default)]
    max_current: Option<f64>,
}

impl From<WireStatus> for PeerStatus {
    fn from(w: WireStatus) -> Self {
        PeerStatus {
            amp: w.amp,
            voltage: w.voltage,
            pilot: w.pilot,
            vehicle: w.vehicle,
            state: w.state,
            config_version: w.config_version,
            config_hash: w.config_hash,
            max_current: w.max_current,
        }
    }
}

pub fn parse_status(body: &str) -> Result<PeerStatus, serde_json::Error> {
    serde_json::from_str::<WireStatus>(body).map(PeerStatus::from)
}

/// Interroge périodiquement chaque pair en ligne et remplit le tableau
pub struct StatusPoller {
    client: reqwest::Client,
    board: StatusBoard,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(board: StatusBoard, interval: Duration, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "status client builder failed, using defaults");
                reqwest::Client::new()
            });
        Self { client, board, interval }
    }

    async fn fetch(&self, host: &str) -> Result<PeerStatus, StatusError> {
        let url = format!("http://{host}/status");
        let response = self
            .client
            .get(&url)
            .header("User-Agent", "loadshare-kernel")
            .send()
            .await
            .map_err(|source| StatusError::Request { host: host.to_string(), source })?;

        if !response.status().is_success() {
            return Err(StatusError::Http {
                host: host.to_string(),
                code: response.status().as_u16(),
            });
        }

        let wire: WireStatus = response
            .json()
            .await
            .map_err(|source| StatusError::Request { host: host.to_string(), source })?;
        Ok(wire.into())
    }

    /// Un passage sur tous les pairs en ligne de l'état publié
    pub async fn poll_once(&self, state: &Shared<GroupState>) {
        let targets: Vec<(String, String)> = state
            .lock()
            .peers
            .iter()
            // un hôte sans domaine ni IP (unité locale anonyme) n'est pas joignable
            .filter(|p| p.online && (p.host.contains('.') || p.host.contains(':')))
            .map(|p| (p.id.clone(), p.host.clone()))
            .collect();

        for (id, host) in targets {
            match self.fetch(&host).await {
                Ok(status) => {
                    debug!(peer = %id, amp = status.amp, state = status.state, "status updated");
                    self.board.update(&id, status);
                }
                Err(e) => {
                    warn!(peer = %id, error = %e, "status unavailable");
                    self.board.evict(&id);
                }
            }
        }
    }

    pub async fn run(self, state: Shared<GroupState>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_once(&state).await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("status poller stopped");
    }
}
