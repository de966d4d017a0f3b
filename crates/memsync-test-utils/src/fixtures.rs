use memsync_config::{MemsyncConfig, StoreConfig};
use memsync_store::model::PHASE_KEY;
use memsync_store::{Record, RecordKind, StoreRole, WorkflowPhase};

/// Code record with string content.
pub fn code_record(id: &str, content: &str) -> Record {
    Record::new(id, RecordKind::Code, content)
}

pub fn phase_record(id: &str, content: &str, phase: WorkflowPhase) -> Record {
    code_record(id, content).with_metadata(PHASE_KEY, phase.as_str())
}

/// `lmdb`, `faiss` and `kuzu` in memory, with `lmdb` as the default store.
pub fn in_memory_config() -> MemsyncConfig {
    MemsyncConfig::builder()
        .store(StoreConfig::new("lmdb", StoreRole::KeyValue))
        .store(StoreConfig::new("faiss", StoreRole::Vector).with_dimension(5))
        .store(StoreConfig::new("kuzu", StoreRole::Graph))
        .default_store("lmdb")
        .build()
}
