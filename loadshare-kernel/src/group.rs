/**
 * GROUP MEMBERSHIP STORE - Liste durable des hôtes qui ont rejoint le groupe
 *
 * RÔLE :
 * Hostnames ajoutés explicitement (POST /loadsharing/peers), indépendants de
 * ce qui est découvrable à l'instant. Persistés en JSON :
 * `{"peers": ["openevse-a7d4.local", ...]}`.
 *
 * FONCTIONNEMENT :
 * - add/remove modifient la mémoire immédiatement, depuis n'importe quel contexte
 * - save() n'écrit que si des changements sont en attente (compteur de révision)
 *   et regroupe toutes les modifications faites depuis la dernière écriture
 * - écriture dans un fichier temporaire puis remplacement atomique
 * - load() : fichier absent = liste vide valide ; JSON invalide = échec,
 *   la liste en mémoire est conservée
 */

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("invalid host: {0}")]
    InvalidHost(String),
    #[error("peer already in group: {0}")]
    AlreadyMember(String),
    #[error("peer not found: {0}")]
    NotFound(String),
    #[error("failed to parse group file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Stockage d'octets persistant (SPIFFS sur la borne, disque ailleurs)
pub trait ByteStore: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn read(&self, path: &Path) -> Result<Vec<u8>, StoreError>;
    fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError>;
    fn rename(&self, from: &Path, to: &Path) -> Result<(), StoreError>;
    fn remove(&self, path: &Path) -> Result<(), StoreError>;
}

/// Implémentation sur le système de fichiers
#[derive(Debug, Default, Clone)]
pub struct FsStore;

impl ByteStore for FsStore {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, StoreError> {
        Ok(std::fs::read(path)?)
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(std::fs::write(path, bytes)?)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), StoreError> {
        Ok(std::fs::rename(from, to)?)
    }

    fn remove(&self, path: &Path) -> Result<(), StoreError> {
        Ok(std::fs::remove_file(path)?)
    }
}

/// Schéma du fichier persistant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupFile {
    pub peers: Vec<String>,
}

/// Contrôle de format à la frontière API : non vide, avec un '.' ou ':'
pub fn validate_host(raw: &str) -> Result<String, GroupError> {
    let host = raw.trim();
    if host.is_empty() {
        return Err(GroupError::InvalidHost("host cannot be empty".into()));
    }
    if !host.contains('.') && !host.contains(':') {
        return Err(GroupError::InvalidHost(format!(
            "{host}: must contain domain or IP"
        )));
    }
    Ok(host.to_string())
}

#[derive(Debug, Default)]
struct Members {
    hosts: Vec<String>,
    revision: u64,
    saved_revision: u64,
}

impl Members {
    fn is_dirty(&self) -> bool {
        self.revision != self.saved_revision
    }
}

pub struct GroupStore {
    path: PathBuf,
    store: Box<dyn ByteStore>,
    members: Mutex<Members>,
    // sérialise les écritures concurrentes
    save_lock: Mutex<()>,
}

impl GroupStore {
    pub fn new(path: impl Into<PathBuf>, store: Box<dyn ByteStore>) -> Self {
        Self {
            path: path.into(),
            store,
            members: Mutex::new(Members::default()),
            save_lock: Mutex::new(()),
        }
    }

    pub fn on_disk(path: impl Into<PathBuf>) -> Self {
        Self::new(path, Box::new(FsStore))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    pub fn add(&self, host: &str) -> Result<(), GroupError> {
        let mut members = self.members.lock();
        if members.hosts.iter().any(|h| h == host) {
            return Err(GroupError::AlreadyMember(host.to_string()));
        }
        members.hosts.push(host.to_string());
        members.revision += 1;
        info!(host, total = members.hosts.len(), "peer joined group");
        Ok(())
    }

    pub fn remove(&self, host: &str) -> Result<(), GroupError> {
        let mut members = self.members.lock();
        let before = members.hosts.len();
        members.hosts.retain(|h| h != host);
        if members.hosts.len() == before {
            return Err(GroupError::NotFound(host.to_string()));
        }
        members.revision += 1;
        info!(host, remaining = members.hosts.len(), "peer left group");
        Ok(())
    }

    pub fn contains(&self, host: &str) -> bool {
        self.members.lock().hosts.iter().any(|h| h == host)
    }

    pub fn list(&self) -> Vec<String> {
        self.members.lock().hosts.clone()
    }

    pub fn len(&self) -> usize {
        self.members.lock().hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.members.lock().is_dirty()
    }

    /// Révision courante : change à chaque add/remove/load réussi
    pub fn revision(&self) -> u64 {
        self.members.lock().revision
    }

    /// Charge la liste depuis le stockage.
    ///
    /// Retourne le nombre d'hôtes chargés. En cas d'erreur, la liste en
    /// mémoire n'est pas touchée.
    pub fn load(&self) -> Result<usize, GroupError> {
        let hosts = if self.store.exists(&self.path) {
            let bytes = self.store.read(&self.path)?;
            let file: GroupFile = serde_json::from_slice(&bytes)?;
            sanitize(file.peers)
        } else {
            debug!(path = %self.path.display(), "no group file, starting empty");
            Vec::new()
        };

        let mut members = self.members.lock();
        members.hosts = hosts;
        members.revision += 1;
        members.saved_revision = members.revision;
        info!(path = %self.path.display(), peers = members.hosts.len(), "group peers loaded");
        Ok(members.hosts.len())
    }

    /// Écrit la liste si elle a changé depuis la dernière écriture réussie.
    ///
    /// Retourne `Ok(false)` quand il n'y avait rien à écrire. Une modification
    /// arrivée pendant l'écriture reste en attente pour le save suivant.
    pub fn save(&self) -> Result<bool, GroupError> {
        let _guard = self.save_lock.lock();

        let (file, revision) = {
            let members = self.members.lock();
            if !members.is_dirty() {
                return Ok(false);
            }
            (GroupFile { peers: members.hosts.clone() }, members.revision)
        };

        let bytes = serde_json::to_vec(&file)?;
        let tmp = self.temp_path();
        self.store.write(&tmp, &bytes)?;
        if self.store.exists(&self.path) {
            self.store.remove(&self.path)?;
        }
        self.store.rename(&tmp, &self.path)?;

        let mut members = self.members.lock();
        members.saved_revision = members.saved_revision.max(revision);
        debug!(path = %self.path.display(), peers = file.peers.len(), "group peers saved");
        Ok(true)
    }

    /// save() pour la tâche coordinateur : une erreur est loguée, jamais propagée
    pub fn flush(&self) {
        if let Err(e) = self.save() {
            warn!(path = %self.path.display(), error = %e, "failed to save group peers, will retry");
        }
    }
}

/// Nettoie une liste chargée : espaces, entrées vides et doublons
fn sanitize(raw: Vec<String>) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::with_capacity(raw.len());
    for entry in raw {
        let host = entry.trim();
        if host.is_empty() {
            warn!("ignoring empty host in group file");
            continue;
        }
        if !hosts.iter().any(|h| h == host) {
            hosts.push(host.to_string());
        }
    }
    hosts
}
