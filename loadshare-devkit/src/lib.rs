/*!
# LoadShare DevKit - Doublures et harness pour tester le coordinateur

- Primitive de découverte scriptée (pas de réseau)
- Stockage en mémoire avec injection de pannes
- Source de statuts statique
- Harness avec horloge simulée et assertions sur l'état du groupe
*/

pub mod query_stub;
pub mod store_stub;
pub mod test_utils;

pub use query_stub::{unit_record, ScriptedQuery, Step};
pub use store_stub::{charging_status, idle_status, MemoryStore, StaticStatusSource, StoreOp};
pub use test_utils::{group_config, TestHarness};
