/**
 * NAVIGATEUR mDNS - Primitive de requête du binaire, en un coup
 *
 * FONCTIONNEMENT :
 * Envoie une seule question PTR pour `_<service>._<proto>.local` au groupe
 * multicast depuis un port éphémère (unicast legacy : les répondeurs
 * renvoient directement sur ce port), puis collecte les réponses jusqu'à la
 * fin de la fenêtre de collecte ou jusqu'à `max_results` instances.
 */

use crate::discovery::{
    DiscoveryError, IpProtocol, QueryHandle, QueryPoll, QueryPrimitive, ServiceQuery, ServiceRecord, TxtEntry,
};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MULTICAST_PORT: u16 = 5353;
const MAX_PACKET_SIZE: usize = 9000;

const TYPE_A: u16 = 1;
const TYPE_PTR: u16 = 12;
const TYPE_TXT: u16 = 16;
const TYPE_SRV: u16 = 33;

/// Ressource décodée d'une réponse
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resource {
    Ptr { name: String, target: String },
    Srv { name: String, port: u16, target: String },
    Txt { name: String, entries: Vec<TxtEntry> },
    A { name: String, addr: Ipv4Addr },
}

struct InFlight {
    id: u64,
    socket: UdpSocket,
    domain: String,
    deadline: Instant,
    max_results: usize,
    resources: Vec<Resource>,
}

pub struct MdnsBrowser {
    collect_window: Duration,
    next_id: u64,
    in_flight: Option<InFlight>,
}

impl MdnsBrowser {
    pub fn new(collect_window: Duration) -> Self {
        Self {
            collect_window,
            next_id: 0,
            in_flight: None,
        }
    }
}

fn service_domain(query: &ServiceQuery) -> String {
    format!("_{}._{}.local", query.service, query.protocol)
}

/// Question PTR unique, id 0, sans récursion
pub(crate) fn build_query(domain: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(domain.len() + 18);
    out.extend_from_slice(&[0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
    for label in domain.split('.').filter(|l| !l.is_empty()) {
        out.push(label.len().min(63) as u8);
        out.extend_from_slice(&label.as_bytes()[..label.len().min(63)]);
    }
    out.push(0);
    out.extend_from_slice(&TYPE_PTR.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*buf.get(at)?, *buf.get(at + 1)?]))
}

/// Lit un nom (avec pointeurs de compression) ; retourne le nom et la position après
fn read_name(buf: &[u8], mut at: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut end: Option<usize> = None;
    let mut jumps = 0;

    loop {
        let len = *buf.get(at)? as usize;
        if len == 0 {
            at += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            let ptr = ((len & 0x3F) << 8) | *buf.get(at + 1)? as usize;
            if end.is_none() {
                end = Some(at + 2);
            }
            jumps += 1;
            if jumps > 32 {
                return None;
            }
            at = ptr;
            continue;
        }
        let label = buf.get(at + 1..at + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        at += 1 + len;
    }

    Some((labels.join("."), end.unwrap_or(at)))
}

fn parse_txt(data: &[u8]) -> Vec<TxtEntry> {
    let mut entries = Vec::new();
    let mut at = 0;
    while at < data.len() {
        let len = data[at] as usize;
        let Some(chunk) = data.get(at + 1..at + 1 + len) else {
            break;
        };
        let text = String::from_utf8_lossy(chunk);
        let entry = match text.split_once('=') {
            Some((k, v)) => TxtEntry { key: Some(k.to_string()), value: Some(v.to_string()) },
            None => TxtEntry { key: Some(text.to_string()), value: None },
        };
        if entry.key.as_deref().is_some_and(|k| !k.is_empty()) {
            entries.push(entry);
        }
        at += 1 + len;
    }
    entries
}

/// Décode toutes les ressources connues d'un paquet de réponse
pub(crate) fn parse_response(buf: &[u8]) -> Option<Vec<Resource>> {
    let flags = read_u16(buf, 2)?;
    if flags & 0x8000 == 0 {
        // une question, pas une réponse
        return Some(Vec::new());
    }
    let questions = read_u16(buf, 4)?;
    let records = read_u16(buf, 6)? as usize + read_u16(buf, 8)? as usize + read_u16(buf, 10)? as usize;

    let mut at = 12;
    for _ in 0..questions {
        let (_, next) = read_name(buf, at)?;
        at = next + 4;
    }

    let mut out = Vec::new();
    for _ in 0..records {
        let (name, next) = read_name(buf, at)?;
        let rtype = read_u16(buf, next)?;
        let rdlen = read_u16(buf, next + 8)? as usize;
        let rdata_at = next + 10;
        let rdata = buf.get(rdata_at..rdata_at + rdlen)?;

        match rtype {
            TYPE_PTR => {
                let (target, _) = read_name(buf, rdata_at)?;
                out.push(Resource::Ptr { name, target });
            }
            TYPE_SRV => {
                let port = read_u16(buf, rdata_at + 4)?;
                let (target, _) = read_name(buf, rdata_at + 6)?;
                out.push(Resource::Srv { name, port, target });
            }
            TYPE_TXT => out.push(Resource::Txt { name, entries: parse_txt(rdata) }),
            TYPE_A if rdlen == 4 => {
                out.push(Resource::A { name, addr: Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]) });
            }
            _ => {}
        }
        at = rdata_at + rdlen;
    }
    Some(out)
}

// les noms DNS ne sont pas sensibles à la casse
fn strip_suffix_ignore_case<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    let cut = name.len().checked_sub(suffix.len())?;
    let tail = name.get(cut..)?;
    tail.eq_ignore_ascii_case(suffix).then(|| &name[..cut])
}

/// Assemble les ressources par instance, dans l'ordre des PTR reçus
pub(crate) fn assemble(domain: &str, resources: &[Resource], max_results: usize) -> Vec<ServiceRecord> {
    let suffix = format!(".{domain}");
    let mut instances: Vec<String> = Vec::new();
    for resource in resources {
        if let Resource::Ptr { name, target } = resource {
            if name.eq_ignore_ascii_case(domain) && !instances.iter().any(|i| i.eq_ignore_ascii_case(target)) {
                instances.push(target.clone());
            }
        }
    }

    let addresses: HashMap<String, Ipv4Addr> = resources
        .iter()
        .filter_map(|r| match r {
            Resource::A { name, addr } => Some((name.to_ascii_lowercase(), *addr)),
            _ => None,
        })
        .collect();

    instances
        .into_iter()
        .take(max_results)
        .map(|full| {
            let instance = strip_suffix_ignore_case(&full, &suffix).unwrap_or(&full).to_string();
            let mut record = ServiceRecord {
                instance_name: Some(instance),
                ..Default::default()
            };
            for resource in resources {
                match resource {
                    Resource::Srv { name, port, target } if name.eq_ignore_ascii_case(&full) => {
                        record.port = *port;
                        record.address = addresses.get(&target.to_ascii_lowercase()).copied();
                        record.hostname = Some(target.clone());
                    }
                    Resource::Txt { name, entries } if name.eq_ignore_ascii_case(&full) => record.txt = entries.clone(),
                    _ => {}
                }
            }
            record
        })
        .collect()
}

impl QueryPrimitive for MdnsBrowser {
    fn start(&mut self, query: &ServiceQuery) -> Result<QueryHandle, DiscoveryError> {
        if self.in_flight.is_some() {
            return Err(DiscoveryError::Busy);
        }
        if query.ip_protocol != IpProtocol::V4 {
            return Err(DiscoveryError::StartFailed("only IPv4 browsing is supported".into()));
        }

        let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(|e| DiscoveryError::StartFailed(e.to_string()))?;
        let domain = service_domain(query);
        let packet = build_query(&domain);
        socket
            .send_to(&packet, SocketAddrV4::new(MULTICAST_ADDR, MULTICAST_PORT))
            .map_err(|e| DiscoveryError::StartFailed(e.to_string()))?;

        self.next_id += 1;
        debug!(domain = %domain, id = self.next_id, "mdns query sent");
        self.in_flight = Some(InFlight {
            id: self.next_id,
            socket,
            domain,
            deadline: Instant::now() + self.collect_window,
            max_results: query.max_results,
            resources: Vec::new(),
        });
        Ok(QueryHandle::new(self.next_id))
    }

    fn poll(&mut self, handle: &mut QueryHandle, wait: Duration) -> QueryPoll {
        let Some(flight) = self.in_flight.as_mut().filter(|f| f.id == handle.id()) else {
            return QueryPoll::Pending;
        };

        let until = Instant::now() + wait;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let now = Instant::now();
            if now >= until || now >= flight.deadline {
                break;
            }
            let remaining = until.min(flight.deadline) - now;
            if flight.socket.set_read_timeout(Some(remaining.max(Duration::from_millis(1)))).is_err() {
                break;
            }
            match flight.socket.recv_from(&mut buf) {
                Ok((n, from)) => match parse_response(&buf[..n]) {
                    Some(resources) => {
                        trace!(%from, count = resources.len(), "mdns response");
                        flight.resources.extend(resources);
                    }
                    None => debug!(%from, "malformed mdns packet ignored"),
                },
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
                Err(e) => {
                    warn!(error = %e, "mdns receive failed");
                    break;
                }
            }
        }

        let found = assemble(&flight.domain, &flight.resources, flight.max_results);
        if Instant::now() >= flight.deadline || found.len() >= flight.max_results {
            return QueryPoll::Complete(found);
        }
        QueryPoll::Pending
    }

    fn release(&mut self, handle: QueryHandle) {
        if self.in_flight.as_ref().is_some_and(|f| f.id == handle.id()) {
            self.in_flight = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(out: &mut Vec<u8>, name: &str) {
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
    }

    fn rr(out: &mut Vec<u8>, owner: &str, rtype: u16, rdata: &[u8]) {
        name(out, owner);
        out.extend_from_slice(&rtype.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&120u32.to_be_bytes());
        out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(rdata);
    }

    fn response() -> Vec<u8> {
        let mut out = vec![0, 0, 0x84, 0, 0, 0, 0, 1, 0, 0, 0, 3];
        let mut ptr = Vec::new();
        name(&mut ptr, "openevse-7856._openevse._tcp.local");
        rr(&mut out, "_openevse._tcp.local", TYPE_PTR, &ptr);

        let mut srv = vec![0, 0, 0, 0, 0, 80];
        name(&mut srv, "openevse-7856.local");
        rr(&mut out, "openevse-7856._openevse._tcp.local", TYPE_SRV, &srv);

        let mut txt = Vec::new();
        for entry in ["id=a7d47856", "version=5.1.2", "flag"] {
            txt.push(entry.len() as u8);
            txt.extend_from_slice(entry.as_bytes());
        }
        rr(&mut out, "openevse-7856._openevse._tcp.local", TYPE_TXT, &txt);
        rr(&mut out, "openevse-7856.local", TYPE_A, &[192, 168, 1, 42]);
        out
    }

    #[test]
    fn test_query_packet_layout() {
        let packet = build_query("_openevse._tcp.local");
        assert_eq!(&packet[..12], &[0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(packet[12], 9);
        assert_eq!(&packet[13..22], b"_openevse");
        assert_eq!(&packet[packet.len() - 4..], &[0, 12, 0, 1]);
    }

    #[test]
    fn test_parse_and_assemble() {
        let resources = parse_response(&response()).unwrap();
        assert_eq!(resources.len(), 4);

        let records = assemble("_openevse._tcp.local", &resources, 20);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.instance_name.as_deref(), Some("openevse-7856"));
        assert_eq!(record.hostname.as_deref(), Some("openevse-7856.local"));
        assert_eq!(record.address, Some(Ipv4Addr::new(192, 168, 1, 42)));
        assert_eq!(record.port, 80);
        assert_eq!(record.txt.len(), 3);
        assert_eq!(record.txt[0], TxtEntry::new("id", "a7d47856"));
        assert_eq!(record.txt[2].value, None);
    }

    #[test]
    fn test_compressed_names() {
        // PTR dont la cible pointe sur le nom de la question (offset 12)
        let mut out = vec![0, 0, 0x84, 0, 0, 1, 0, 1, 0, 0, 0, 0];
        name(&mut out, "_openevse._tcp.local");
        out.extend_from_slice(&[0, 12, 0, 1]);
        out.extend_from_slice(&[0xC0, 12]);
        out.extend_from_slice(&TYPE_PTR.to_be_bytes());
        out.extend_from_slice(&[0, 1, 0, 0, 0, 120]);
        let rdata = [4, b'u', b'n', b'i', b't', 0xC0, 12];
        out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&rdata);

        let resources = parse_response(&out).unwrap();
        assert_eq!(
            resources,
            vec![Resource::Ptr {
                name: "_openevse._tcp.local".into(),
                target: "unit._openevse._tcp.local".into()
            }]
        );
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let packet = response();
        assert!(parse_response(&packet[..packet.len() - 3]).is_none());
        assert_eq!(parse_response(&build_query("_x._tcp.local")), Some(Vec::new()));
    }

    #[test]
    fn test_max_results_caps_instances() {
        let resources: Vec<Resource> = (0..5)
            .map(|i| Resource::Ptr {
                name: "_openevse._tcp.local".into(),
                target: format!("unit-{i}._openevse._tcp.local"),
            })
            .collect();
        assert_eq!(assemble("_openevse._tcp.local", &resources, 3).len(), 3);
    }

    #[test]
    fn test_owner_names_match_ignoring_case() {
        let resources = vec![
            Resource::Ptr {
                name: "_openevse._tcp.local".into(),
                target: "OpenEVSE-7856._openevse._tcp.local".into(),
            },
            Resource::Srv {
                name: "openevse-7856._OPENEVSE._tcp.local".into(),
                port: 80,
                target: "openevse-7856.local".into(),
            },
            Resource::Txt {
                name: "OPENEVSE-7856._openevse._tcp.local".into(),
                entries: vec![TxtEntry::new("id", "a7d47856")],
            },
            Resource::A {
                name: "OpenEVSE-7856.local".into(),
                addr: Ipv4Addr::new(192, 168, 1, 40),
            },
        ];

        let records = assemble("_OpenEVSE._tcp.local", &resources, 10);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.instance_name.as_deref(), Some("OpenEVSE-7856"));
        assert_eq!(record.port, 80);
        assert_eq!(record.hostname.as_deref(), Some("openevse-7856.local"));
        assert_eq!(record.address, Some(Ipv4Addr::new(192, 168, 1, 40)));
        assert_eq!(record.txt, vec![TxtEntry::new("id", "a7d47856")]);
    }
}
