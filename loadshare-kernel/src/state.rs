//! État partagé entre la tâche coordinateur et les handlers HTTP.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Déclencheur manuel de découverte (POST /loadsharing/discover).
///
/// Peut être armé depuis n'importe quel contexte ; la tâche coordinateur
/// le consomme au tick suivant et se fait réveiller immédiatement.
#[derive(Clone, Default)]
pub struct DiscoveryTrigger {
    armed: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl DiscoveryTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.armed.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Retourne `true` une seule fois par `fire()`.
    pub fn take(&self) -> bool {
        self.armed.swap(false, Ordering::AcqRel)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub async fn notified(&self) {
        self.wake.notified().await
    }
}
