/**
 * PEER REGISTRY - Vue fusionnée des pairs découverts et des membres du groupe
 *
 * RÔLE :
 * Combine les résultats transitoires de la découverte et la liste durable du
 * groupe en une seule vue indexée par host.
 *
 * ORDRE :
 * Pairs découverts d'abord (ordre de découverte), puis hôtes rejoints non
 * découverts (hors ligne). Un host n'apparaît jamais deux fois.
 */

use crate::discovery::DiscoveredPeer;
use crate::models::Peer;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Entrée de GET /loadsharing/peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub host: String,
    pub ip: String,
    pub online: bool,
    pub joined: bool,
}

/// Id par défaut : le host sans le suffixe `.local`
pub fn derive_id(host: &str) -> String {
    host.strip_suffix(".local").unwrap_or(host).to_string()
}

fn advertised_id(peer: &DiscoveredPeer) -> String {
    peer.txt("id")
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| derive_id(&peer.hostname))
}

/// Vue unifiée pour l'API.
///
/// Une entrée est gardée si elle est en ligne et `include_discovered` est
/// demandé, ou rejointe et `include_group` est demandé.
pub fn all_peers(
    discovered: &[DiscoveredPeer],
    joined: &[String],
    include_discovered: bool,
    include_group: bool,
) -> Vec<PeerInfo> {
    let mut merged: Vec<PeerInfo> = Vec::with_capacity(discovered.len() + joined.len());

    for peer in discovered {
        merged.push(PeerInfo {
            id: advertised_id(peer),
            name: peer.service_name.clone(),
            host: peer.hostname.clone(),
            ip: peer.ip_address.clone(),
            online: true,
            joined: joined.iter().any(|h| h == &peer.hostname),
        });
    }

    for host in joined {
        if merged.iter().any(|p| &p.host == host) {
            continue;
        }
        merged.push(PeerInfo {
            id: derive_id(host),
            name: host.clone(),
            host: host.clone(),
            ip: String::new(),
            online: false,
            joined: true,
        });
    }

    merged.retain(|p| (include_discovered && p.online) || (include_group && p.joined));
    merged
}

/// Instantané de tous les pairs connus, mis à jour par host
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    local_id: String,
    local_host: String,
    peers: Vec<Peer>,
}

impl PeerRegistry {
    pub fn new(local_id: impl Into<String>, local_host: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            local_host: local_host.into(),
            peers: Vec::new(),
        }
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut [Peer] {
        &mut self.peers
    }

    pub fn local(&self) -> Option<&Peer> {
        self.peers.iter().find(|p| p.local)
    }

    pub fn peer_by_host(&self, host: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.host == host)
    }

    pub fn peer_by_id(&self, id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    fn is_local_host(&self, host: &str) -> bool {
        !self.local_host.is_empty() && self.local_host.eq_ignore_ascii_case(host)
    }

    /// Reconstruit l'instantané depuis le dernier cache et la liste du groupe.
    ///
    /// Un host déjà vu garde son id ; un pair absent du cache et du groupe
    /// disparaît. L'unité locale est toujours présente, en ligne.
    pub fn refresh(&mut self, discovered: &[DiscoveredPeer], joined: &[String], now: OffsetDateTime) {
        let previous = std::mem::take(&mut self.peers);
        let find_prev = |host: &str| previous.iter().find(|p| p.host == host);

        let mut next: Vec<Peer> = Vec::with_capacity(discovered.len() + joined.len() + 1);

        for found in discovered {
            let mut peer = match find_prev(&found.hostname) {
                Some(prev) => prev.clone(),
                None => Peer::new(advertised_id(found), found.hostname.clone()),
            };
            peer.name = found.service_name.clone();
            peer.ip = found.ip_address.clone();
            if let Some(version) = found.txt("version") {
                peer.version = version.to_string();
            }
            peer.advertised_max_current = found
                .txt("max_current")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0);
            peer.online = true;
            peer.joined = joined.iter().any(|h| h == &found.hostname);
            peer.last_seen = Some(now);
            next.push(peer);
        }

        for host in joined {
            if next.iter().any(|p| &p.host == host) {
                continue;
            }
            let mut peer = match find_prev(host) {
                Some(prev) => prev.clone(),
                None => Peer::new(derive_id(host), host.clone()),
            };
            peer.ip.clear();
            peer.online = false;
            peer.joined = true;
            peer.status = Default::default();
            next.push(peer);
        }

        for peer in next.iter_mut() {
            peer.local = self.is_local_host(&peer.host) || peer.id == self.local_id;
        }

        if !next.iter().any(|p| p.local) {
            let host = if self.local_host.is_empty() {
                self.local_id.clone()
            } else {
                self.local_host.clone()
            };
            let mut local = match find_prev(&host) {
                Some(prev) => prev.clone(),
                None => Peer::new(self.local_id.clone(), host),
            };
            local.local = true;
            local.online = true;
            local.last_seen = Some(now);
            next.insert(0, local);
        } else {
            // on se joint toujours à soi-même
            for peer in next.iter_mut().filter(|p| p.local) {
                peer.online = true;
                peer.last_seen = Some(now);
            }
        }

        self.peers = next;
    }

    /// Pairs distants en ligne
    pub fn remote_online(&self) -> usize {
        self.peers.iter().filter(|p| p.online && !p.local).count()
    }
}
