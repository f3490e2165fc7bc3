/**
 * MODÈLE DE DONNÉES - Pairs, statuts et allocations du groupe de partage
 *
 * RÔLE :
 * Types partagés par tous les composants du coordinateur et sérialisés
 * tels quels par l'API REST (/loadsharing/status, /loadsharing/peers).
 *
 * INVARIANTS :
 * - `host` est unique dans un instantané du registre (clé d'identité)
 * - somme des `target_current` <= max_current * safety_factor après calcul
 * - online_count + offline_count == peers.len()
 */

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// États J1772 rapportés par l'EVSE
pub mod evse_state {
    pub const NOT_CONNECTED: u8 = 1;
    pub const CONNECTED: u8 = 2;
    pub const CHARGING: u8 = 3;
    pub const VENT_REQUIRED: u8 = 4;
    pub const SLEEPING: u8 = 254;
    pub const DISABLED: u8 = 255;
}

/// Instantané du statut de charge d'un pair (fourni par la source de statut)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    /// Courant mesuré (A)
    #[serde(default)]
    pub amp: f64,
    /// Tension mesurée (V)
    #[serde(default)]
    pub voltage: f64,
    /// Consigne pilote actuelle (A)
    #[serde(default)]
    pub pilot: f64,
    /// Véhicule branché
    #[serde(default)]
    pub vehicle: bool,
    /// Code d'état J1772
    #[serde(default)]
    pub state: u8,
    #[serde(default)]
    pub config_version: u32,
    #[serde(default)]
    pub config_hash: String,
    /// Plafond matériel connu (pilote max), si l'unité le publie
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_current: Option<f64>,
}

impl PeerStatus {
    /// Véhicule branché et en demande de charge (état C ou D)
    pub fn is_demanding(&self) -> bool {
        self.vehicle
            && matches!(self.state, evse_state::CHARGING | evse_state::VENT_REQUIRED)
    }
}

/// Membre du groupe (découvert, rejoint, ou les deux)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    /// Identifiant stable (ex: "openevse-a7d4"), conservé entre rafraîchissements
    pub id: String,
    pub name: String,
    pub host: String,
    pub ip: String,
    pub version: String,
    pub online: bool,
    pub joined: bool,
    /// Unité locale (celle qui exécute ce coordinateur)
    #[serde(default)]
    pub local: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    /// Plafond annoncé en TXT (`max_current`), utilisé si le statut n'en donne pas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertised_max_current: Option<f64>,
    pub status: PeerStatus,
}

impl Peer {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            id: id.into(),
            name: host.clone(),
            host,
            ip: String::new(),
            version: String::new(),
            online: false,
            joined: false,
            local: false,
            last_seen: None,
            advertised_max_current: None,
            status: PeerStatus::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationReason {
    EqualShare,
    Offline,
    NotCharging,
    ConfigMismatch,
    Failsafe,
}

/// Résultat de l'algorithme pour un membre
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub target_current: f64,
    pub reason: AllocationReason,
}

impl Allocation {
    pub fn new(id: impl Into<String>, target_current: f64, reason: AllocationReason) -> Self {
        Self {
            id: id.into(),
            target_current,
            reason,
        }
    }
}

/// État agrégé du groupe, recalculé en entier à chaque tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupState {
    pub enabled: bool,
    pub group_id: String,
    pub group_max_current: f64,
    pub safety_factor: f64,
    pub peers: Vec<Peer>,
    pub allocations: Vec<Allocation>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub computed_at: Option<OffsetDateTime>,
    pub failsafe_active: bool,
    pub online_count: usize,
    pub offline_count: usize,
    pub config_consistent: bool,
    pub config_issues: Vec<String>,
}

impl GroupState {
    pub fn budget(&self) -> f64 {
        self.group_max_current * self.safety_factor
    }

    pub fn total_allocated(&self) -> f64 {
        self.allocations.iter().map(|a| a.target_current).sum()
    }

    pub fn allocation(&self, id: &str) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.id == id)
    }

    pub fn peer_by_host(&self, host: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.host == host)
    }
}

impl Default for GroupState {
    fn default() -> Self {
        Self {
            enabled: false,
            group_id: String::new(),
            group_max_current: 0.0,
            safety_factor: 1.0,
            peers: Vec::new(),
            allocations: Vec::new(),
            computed_at: None,
            failsafe_active: false,
            online_count: 0,
            offline_count: 0,
            config_consistent: true,
            config_issues: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demanding_requires_vehicle_and_active_state() {
        let mut status = PeerStatus {
            vehicle: true,
            state: evse_state::CHARGING,
            ..Default::default()
        };
        assert!(status.is_demanding());

        status.state = evse_state::CONNECTED;
        assert!(!status.is_demanding());

        status.state = evse_state::VENT_REQUIRED;
        assert!(status.is_demanding());

        status.vehicle = false;
        assert!(!status.is_demanding());
    }

    #[test]
    fn test_reason_serializes_snake_case() {
        let alloc = Allocation::new("openevse-1", 9.6, AllocationReason::EqualShare);
        let json = serde_json::to_value(&alloc).unwrap();
        assert_eq!(json["reason"], "equal_share");

        let json = serde_json::to_value(AllocationReason::ConfigMismatch).unwrap();
        assert_eq!(json, "config_mismatch");
    }

    #[test]
    fn test_status_deserializes_with_missing_fields() {
        let status: PeerStatus = serde_json::from_str(r#"{"amp": 12.5, "vehicle": true}"#).unwrap();
        assert_eq!(status.amp, 12.5);
        assert!(status.vehicle);
        assert_eq!(status.state, 0);
        assert!(status.max_current.is_none());
    }
}
