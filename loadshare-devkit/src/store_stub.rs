/*!
Stockage en mémoire et source de statuts statique

- `MemoryStore` : ByteStore sans disque, avec injection de pannes et journal
  des opérations (pour vérifier l'écriture atomique temp + rename)
- `StaticStatusSource` : statuts fixés par le test, par id de pair
*/

use loadshare_kernel::group::{ByteStore, StoreError};
use loadshare_kernel::models::{evse_state, Peer, PeerStatus};
use loadshare_kernel::status::{StatusError, StatusSource};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Write(PathBuf),
    Rename(PathBuf, PathBuf),
    Remove(PathBuf),
}

type WriteHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    files: HashMap<PathBuf, Vec<u8>>,
    ops: Vec<StoreOp>,
    fail_writes: u32,
    fail_renames: u32,
    /// Exécuté pendant la prochaine écriture, verrou relâché
    on_write: Option<WriteHook>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

fn injected(what: &str) -> StoreError {
    StoreError::Io(io::Error::new(io::ErrorKind::Other, format!("injected {what} failure")))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<PathBuf>, bytes: &[u8]) -> Self {
        self.inner.lock().unwrap().files.insert(path.into(), bytes.to_vec());
        self
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.inner.lock().unwrap().fail_writes = count;
    }

    /// `hook` tourne au milieu de la prochaine écriture, avant qu'elle aboutisse
    pub fn on_next_write(&self, hook: impl FnOnce() + Send + 'static) {
        self.inner.lock().unwrap().on_write = Some(Box::new(hook));
    }

    pub fn fail_next_renames(&self, count: u32) {
        self.inner.lock().unwrap().fail_renames = count;
    }

    pub fn contents(&self, path: impl AsRef<Path>) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .files
            .get(path.as_ref())
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.inner.lock().unwrap().ops.clone()
    }

    pub fn write_count(&self) -> usize {
        self.ops().iter().filter(|op| matches!(op, StoreOp::Write(_))).count()
    }

    pub fn clear_ops(&self) {
        self.inner.lock().unwrap().ops.clear();
    }
}

impl ByteStore for MemoryStore {
    fn exists(&self, path: &Path) -> bool {
        self.inner.lock().unwrap().files.contains_key(path)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::Io(io::Error::new(io::ErrorKind::NotFound, "no such file")))
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let hook = self.inner.lock().unwrap().on_write.take();
        if let Some(hook) = hook {
            hook();
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_writes > 0 {
            inner.fail_writes -= 1;
            return Err(injected("write"));
        }
        inner.files.insert(path.to_path_buf(), bytes.to_vec());
        inner.ops.push(StoreOp::Write(path.to_path_buf()));
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_renames > 0 {
            inner.fail_renames -= 1;
            return Err(injected("rename"));
        }
        let Some(bytes) = inner.files.remove(from) else {
            return Err(StoreError::Io(io::Error::new(io::ErrorKind::NotFound, "rename source missing")));
        };
        inner.files.insert(to.to_path_buf(), bytes);
        inner.ops.push(StoreOp::Rename(from.to_path_buf(), to.to_path_buf()));
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.files.remove(path);
        inner.ops.push(StoreOp::Remove(path.to_path_buf()));
        Ok(())
    }
}

/// Statuts fixés à la main, par id de pair
#[derive(Clone, Default)]
pub struct StaticStatusSource {
    statuses: Arc<Mutex<HashMap<String, PeerStatus>>>,
}

impl StaticStatusSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: &str, status: PeerStatus) {
        self.statuses.lock().unwrap().insert(id.to_string(), status);
    }

    pub fn clear(&self, id: &str) {
        self.statuses.lock().unwrap().remove(id);
    }

    pub fn set_charging(&self, id: &str) {
        self.set(id, charging_status());
    }
}

impl StatusSource for StaticStatusSource {
    fn peer_status(&self, peer: &Peer) -> Result<PeerStatus, StatusError> {
        self.statuses
            .lock()
            .unwrap()
            .get(&peer.id)
            .cloned()
            .ok_or_else(|| StatusError::Unavailable(peer.id.clone()))
    }
}

/// Véhicule branché, en charge, config par défaut
pub fn charging_status() -> PeerStatus {
    PeerStatus {
        amp: 6.0,
        voltage: 240.0,
        pilot: 6.0,
        vehicle: true,
        state: evse_state::CHARGING,
        ..Default::default()
    }
}

pub fn idle_status() -> PeerStatus {
    PeerStatus {
        voltage: 240.0,
        state: evse_state::NOT_CONNECTED,
        ..Default::default()
    }
}
