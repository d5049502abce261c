//! NUMA-aware, shared-everything hash storage core.
//!
//! An in-memory, multi-core transactional key-value engine's hash index: a multi-level
//! intermediate-page tree over per-bin chains of append-only data pages, optimistic
//! concurrency via per-record XIDs, and NUMA-local page pools (see `DESIGN.md` for how each
//! module's design was arrived at).

pub mod control_block;
pub mod data_page;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod hash_combo;
pub mod hash_storage;
pub mod intermediate_page;
pub mod location;
pub mod numa;
pub mod page;
pub mod registry;
pub mod thread_context;

pub use engine::{Engine, EngineConfig, LoggerPosition, SavepointState};
pub use epoch::{Epoch, Xid};
pub use error::{CoreError, ErrorCode, Result, ResultExt};
pub use hash_combo::{HashCombo, HashMetadata};
pub use hash_storage::{HashStorage, LogEntry};
pub use numa::NumaTopology;
pub use page::PAGE_SIZE;
pub use thread_context::ThreadContext;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_to_end_insert_get_delete() {
        let engine = Engine::builder()
            .topology(NumaTopology::single_node())
            .volatile_pages_per_node(512)
            .build();
        let mut ctx = engine.new_thread_context(0);
        let storage = engine
            .create_hash_storage(&mut ctx, "accounts", 1000)
            .unwrap();

        storage
            .insert_record(&mut ctx, b"alice", &100i64.to_le_bytes(), Epoch::new(1))
            .unwrap();
        storage
            .insert_record(&mut ctx, b"bob", &50i64.to_le_bytes(), Epoch::new(1))
            .unwrap();
        assert_eq!(
            storage.get_record(&mut ctx, b"alice").unwrap(),
            100i64.to_le_bytes()
        );

        let balance = storage
            .increment_record(&mut ctx, b"alice", -20, Epoch::new(1))
            .unwrap();
        assert_eq!(balance, 80);
        assert_eq!(
            storage.get_record(&mut ctx, b"alice").unwrap(),
            80i64.to_le_bytes()
        );

        storage.delete_record(&mut ctx, b"bob", Epoch::new(1)).unwrap();
        assert!(storage.get_record(&mut ctx, b"bob").is_err());

        engine.drop_hash_storage(&mut ctx, &storage);
    }
}
