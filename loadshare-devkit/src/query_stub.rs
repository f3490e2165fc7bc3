/*!
Primitive de découverte scriptée pour tests sans réseau

Rejoue une suite de réponses de poll par requête et enregistre chaque appel
(start, poll, release) pour vérifier qu'un handle n'est jamais interrogé
après libération ni libéré deux fois.
*/

use loadshare_kernel::discovery::{
    DiscoveryError, QueryHandle, QueryPoll, QueryPrimitive, ServiceQuery, ServiceRecord, TxtEntry,
};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Réponse d'un poll
#[derive(Debug, Clone)]
pub enum Step {
    Pending,
    Complete(Vec<ServiceRecord>),
}

#[derive(Debug, Default)]
struct Log {
    started: Vec<u64>,
    released: Vec<u64>,
    polls: u64,
    double_releases: u64,
    polls_after_release: u64,
    last_query: Option<ServiceQuery>,
}

#[derive(Debug, Default)]
struct Script {
    steps: VecDeque<Step>,
    /// Réponse quand le script est épuisé
    fallback: Option<Vec<ServiceRecord>>,
    fail_starts: u32,
}

/// Primitive scriptée ; les clones partagent le même journal et le même script
#[derive(Clone, Default)]
pub struct ScriptedQuery {
    log: Arc<Mutex<Log>>,
    script: Arc<Mutex<Script>>,
}

impl ScriptedQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chaque requête se termine au premier poll avec ces enregistrements
    pub fn always(records: Vec<ServiceRecord>) -> Self {
        let query = Self::new();
        query.script.lock().unwrap().fallback = Some(records);
        query
    }

    /// Ajoute des réponses de poll à rejouer dans l'ordre
    pub fn push(&self, step: Step) -> &Self {
        self.script.lock().unwrap().steps.push_back(step);
        self
    }

    pub fn push_pending(&self, count: usize) -> &Self {
        for _ in 0..count {
            self.push(Step::Pending);
        }
        self
    }

    pub fn set_fallback(&self, records: Option<Vec<ServiceRecord>>) {
        self.script.lock().unwrap().fallback = records;
    }

    /// Les `count` prochains `start` échouent
    pub fn fail_next_starts(&self, count: u32) {
        self.script.lock().unwrap().fail_starts = count;
    }

    pub fn started(&self) -> usize {
        self.log.lock().unwrap().started.len()
    }

    pub fn released(&self) -> Vec<u64> {
        self.log.lock().unwrap().released.clone()
    }

    pub fn polls(&self) -> u64 {
        self.log.lock().unwrap().polls
    }

    /// Handles démarrés et pas encore libérés
    pub fn outstanding(&self) -> usize {
        let log = self.log.lock().unwrap();
        log.started.iter().filter(|id| !log.released.contains(id)).count()
    }

    pub fn double_releases(&self) -> u64 {
        self.log.lock().unwrap().double_releases
    }

    pub fn polls_after_release(&self) -> u64 {
        self.log.lock().unwrap().polls_after_release
    }

    pub fn last_query(&self) -> Option<ServiceQuery> {
        self.log.lock().unwrap().last_query.clone()
    }
}

impl QueryPrimitive for ScriptedQuery {
    fn start(&mut self, query: &ServiceQuery) -> Result<QueryHandle, DiscoveryError> {
        {
            let mut script = self.script.lock().unwrap();
            if script.fail_starts > 0 {
                script.fail_starts -= 1;
                return Err(DiscoveryError::StartFailed("scripted start failure".into()));
            }
        }
        let mut log = self.log.lock().unwrap();
        let id = log.started.len() as u64 + 1;
        log.started.push(id);
        log.last_query = Some(query.clone());
        tracing::debug!(id, service = %query.service, "scripted query started");
        Ok(QueryHandle::new(id))
    }

    fn poll(&mut self, handle: &mut QueryHandle, _wait: Duration) -> QueryPoll {
        {
            let mut log = self.log.lock().unwrap();
            log.polls += 1;
            if log.released.contains(&handle.id()) {
                log.polls_after_release += 1;
                return QueryPoll::Pending;
            }
        }
        let mut script = self.script.lock().unwrap();
        match script.steps.pop_front() {
            Some(Step::Pending) => QueryPoll::Pending,
            Some(Step::Complete(records)) => QueryPoll::Complete(records),
            None => match &script.fallback {
                Some(records) => QueryPoll::Complete(records.clone()),
                None => QueryPoll::Pending,
            },
        }
    }

    fn release(&mut self, handle: QueryHandle) {
        let mut log = self.log.lock().unwrap();
        if log.released.contains(&handle.id()) {
            log.double_releases += 1;
            return;
        }
        log.released.push(handle.id());
    }
}

/// Enregistrement mDNS typique d'une borne
pub fn unit_record(instance: &str, ip: [u8; 4], txt: &[(&str, &str)]) -> ServiceRecord {
    ServiceRecord {
        instance_name: Some(instance.to_string()),
        hostname: Some(format!("{instance}.local")),
        address: Some(Ipv4Addr::from(ip)),
        port: 80,
        txt: txt.iter().map(|(k, v)| TxtEntry::new(k, v)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadshare_kernel::config::DiscoveryConf;

    #[test]
    fn test_script_replays_in_order() {
        let mut query = ScriptedQuery::new();
        query.push_pending(1).push(Step::Complete(vec![unit_record("a", [10, 0, 0, 1], &[])]));

        let mut handle = query.start(&ServiceQuery::from_config(&DiscoveryConf::default())).unwrap();
        assert!(matches!(query.poll(&mut handle, Duration::ZERO), QueryPoll::Pending));
        match query.poll(&mut handle, Duration::ZERO) {
            QueryPoll::Complete(records) => assert_eq!(records.len(), 1),
            QueryPoll::Pending => panic!("expected completion"),
        }
        assert_eq!(query.outstanding(), 1);
        query.release(handle);
        assert_eq!(query.outstanding(), 0);
        assert_eq!(query.last_query().unwrap().service, "openevse");
    }

    #[test]
    fn test_detects_double_release() {
        let mut query = ScriptedQuery::new();
        let cfg = ServiceQuery::from_config(&DiscoveryConf::default());
        let handle = query.start(&cfg).unwrap();
        query.release(handle);
        // un handle forgé avec le même id simule une double libération
        query.release(QueryHandle::new(1));
        assert_eq!(query.double_releases(), 1);
    }

    #[test]
    fn test_failing_starts() {
        let mut query = ScriptedQuery::new();
        query.fail_next_starts(2);
        let cfg = ServiceQuery::from_config(&DiscoveryConf::default());
        assert!(query.start(&cfg).is_err());
        assert!(query.start(&cfg).is_err());
        assert!(query.start(&cfg).is_ok());
        assert_eq!(query.started(), 1);
    }
}
