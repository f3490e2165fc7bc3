/**
 * MOTEUR D'ALLOCATION - Répartition du budget du circuit entre les pairs
 *
 * ALGORITHME (recalcul complet à chaque tick) :
 * 1. Pairs hors ligne → 0 A `offline` ; en ligne sans demande → 0 A `not_charging`
 * 2. Cohérence de config : hash/version de chaque pair demandeur vs l'unité locale
 * 3. Config cohérente → part égale avec plafonds (water-filling)
 *    Config divergente → plancher fixe par pair demandeur
 * 4. Failsafe → l'allocation locale est forcée au courant de repli
 * 5. Post-condition : somme <= max_current * safety_factor, l'excédent est
 *    retiré en partant du dernier pair (ordre du registre)
 */

use crate::config::{GroupConf, LocalConf};
use crate::models::{Allocation, AllocationReason, GroupState, Peer};
use time::OffsetDateTime;
use tracing::{debug, warn};

/// Compte les ticks consécutifs sans visibilité sur le groupe
#[derive(Debug, Clone, Default)]
pub struct FailsafeMonitor {
    missed: u32,
    threshold: u32,
}

impl FailsafeMonitor {
    pub fn new(threshold: u32) -> Self {
        Self { missed: 0, threshold }
    }

    /// `visible` : au moins un pair distant découvert avec un cache valide
    pub fn observe(&mut self, visible: bool) -> bool {
        if visible {
            self.missed = 0;
        } else {
            self.missed = self.missed.saturating_add(1);
        }
        self.tripped()
    }

    pub fn tripped(&self) -> bool {
        self.missed > self.threshold
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn reset(&mut self) {
        self.missed = 0;
    }
}

/// Part égale bornée par les plafonds, redistribution itérative du reste.
///
/// Le résultat est dans l'ordre des entrées ; la somme ne dépasse jamais `budget`.
pub fn water_fill(budget: f64, ceilings: &[Option<f64>]) -> Vec<f64> {
    let mut shares = vec![0.0; ceilings.len()];
    let mut open: Vec<usize> = (0..ceilings.len()).collect();
    let mut remaining = budget.max(0.0);

    while !open.is_empty() {
        let share = remaining / open.len() as f64;
        let capped: Vec<usize> = open
            .iter()
            .copied()
            .filter(|&i| ceilings[i].is_some_and(|c| c < share))
            .collect();

        if capped.is_empty() {
            for &i in &open {
                shares[i] = share;
            }
            break;
        }

        for &i in &capped {
            let ceiling = ceilings[i].unwrap_or(0.0).max(0.0);
            shares[i] = ceiling;
            remaining -= ceiling;
        }
        open.retain(|i| !capped.contains(i));
    }

    shares
}

#[derive(Debug, Clone)]
pub struct AllocationEngine {
    group: GroupConf,
    local_version: u32,
    local_hash: String,
}

impl AllocationEngine {
    pub fn new(group: GroupConf, local: &LocalConf) -> Self {
        Self {
            group,
            local_version: local.config_version,
            local_hash: local.config_hash.clone(),
        }
    }

    pub fn budget(&self) -> f64 {
        self.group.budget()
    }

    pub fn group(&self) -> &GroupConf {
        &self.group
    }

    /// Plafond matériel : celui du statut en priorité, sinon celui annoncé en TXT
    fn ceiling(peer: &Peer) -> Option<f64> {
        peer.status
            .max_current
            .or(peer.advertised_max_current)
            .filter(|c| c.is_finite())
    }

    fn mismatch(&self, peer: &Peer) -> Option<String> {
        if peer.local {
            return None;
        }
        let status = &peer.status;
        if status.config_hash == self.local_hash && status.config_version == self.local_version {
            return None;
        }
        Some(format!(
            "{} ({}): config version {} hash '{}' differs from local version {} hash '{}'",
            peer.id, peer.host, status.config_version, status.config_hash, self.local_version, self.local_hash
        ))
    }

    /// Recalcule l'état complet du groupe à partir de l'instantané du registre.
    pub fn compute(&self, peers: &[Peer], failsafe: bool, now: OffsetDateTime) -> GroupState {
        let budget = self.budget();
        let online_count = peers.iter().filter(|p| p.online).count();

        let mut state = GroupState {
            enabled: self.group.enabled,
            group_id: self.group.group_id.clone(),
            group_max_current: self.group.max_current,
            safety_factor: self.group.safety_factor,
            peers: peers.to_vec(),
            allocations: Vec::with_capacity(peers.len()),
            computed_at: Some(now),
            failsafe_active: false,
            online_count,
            offline_count: peers.len() - online_count,
            config_consistent: true,
            config_issues: Vec::new(),
        };

        if !self.group.enabled {
            return state;
        }

        let demanding: Vec<usize> = peers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.online && p.status.is_demanding())
            .map(|(i, _)| i)
            .collect();

        for &i in &demanding {
            if let Some(issue) = self.mismatch(&peers[i]) {
                warn!(peer = %peers[i].id, host = %peers[i].host, "config mismatch");
                state.config_issues.push(issue);
            }
        }
        state.config_consistent = state.config_issues.is_empty();

        // Part de chaque demandeur, indexée comme `demanding`
        let shares: Vec<f64> = if demanding.is_empty() {
            Vec::new()
        } else if state.config_consistent {
            let ceilings: Vec<Option<f64>> = demanding.iter().map(|&i| Self::ceiling(&peers[i])).collect();
            water_fill(budget, &ceilings)
        } else {
            let floor = self.group.mismatch_current.min(budget / demanding.len() as f64).max(0.0);
            demanding
                .iter()
                .map(|&i| Self::ceiling(&peers[i]).map_or(floor, |c| floor.min(c.max(0.0))))
                .collect()
        };

        let demand_reason = if state.config_consistent {
            AllocationReason::EqualShare
        } else {
            AllocationReason::ConfigMismatch
        };

        for (i, peer) in peers.iter().enumerate() {
            let allocation = if !peer.online {
                Allocation::new(&peer.id, 0.0, AllocationReason::Offline)
            } else if let Some(pos) = demanding.iter().position(|&d| d == i) {
                Allocation::new(&peer.id, shares[pos], demand_reason)
            } else {
                Allocation::new(&peer.id, 0.0, AllocationReason::NotCharging)
            };
            state.allocations.push(allocation);
        }

        if failsafe {
            state.failsafe_active = true;
            let floor = self.group.failsafe_current.min(budget).max(0.0);
            let local_ids: Vec<&str> = peers.iter().filter(|p| p.local).map(|p| p.id.as_str()).collect();
            // ne fait que baisser : une unité au repos ou plafonnée plus bas garde sa valeur
            for allocation in state.allocations.iter_mut().filter(|a| local_ids.contains(&a.id.as_str())) {
                if allocation.target_current > floor {
                    allocation.target_current = floor;
                    allocation.reason = AllocationReason::Failsafe;
                }
            }
            warn!(floor, "failsafe active: group not visible");
        }

        enforce_budget(&mut state.allocations, budget);

        debug!(
            demanding = demanding.len(),
            total = state.total_allocated(),
            budget,
            consistent = state.config_consistent,
            "allocations computed"
        );
        state
    }
}

/// Retire l'excédent éventuel en partant de la fin de la liste
pub fn enforce_budget(allocations: &mut [Allocation], budget: f64) {
    let budget = budget.max(0.0);
    // les arrondis peuvent laisser un résidu : on repasse jusqu'à respecter le budget
    loop {
        let total: f64 = allocations.iter().map(|a| a.target_current).sum();
        if total <= budget {
            return;
        }
        let mut excess = total - budget;
        let mut trimmed = false;
        for allocation in allocations.iter_mut().rev() {
            if excess <= 0.0 {
                break;
            }
            if allocation.target_current <= 0.0 {
                continue;
            }
            let before = allocation.target_current;
            let cut = excess.min(before);
            allocation.target_current = (before - cut).max(0.0);
            if allocation.target_current == before {
                allocation.target_current = next_down(before);
            }
            excess -= cut;
            trimmed = true;
        }
        if !trimmed {
            return;
        }
    }
}

fn next_down(x: f64) -> f64 {
    if x <= 0.0 {
        0.0
    } else {
        f64::from_bits(x.to_bits() - 1)
    }
}
