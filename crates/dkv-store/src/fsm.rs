//! The key-value state machine.
//!
//! Decodes committed command records and drives them into a
//! [`Storer`]; serializes and restores full snapshots using the streaming
//! record codec. Apply must never panic on malformed input: a bad entry is
//! reported to the submitter and the node keeps running.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use dkv_kv::Storer;
use dkv_raft::{Fsm, FsmError, FsmSnapshot, LogEntry, SnapshotSink};
use dkv_wire::snapshot::{SnapshotReader, SnapshotWriter};
use dkv_wire::Command;

/// Adapts a [`Storer`] to the consensus engine.
pub struct KvFsm {
    storer: Arc<dyn Storer>,
}

impl KvFsm {
    /// Wraps a store.
    pub fn new(storer: Arc<dyn Storer>) -> Self {
        Self { storer }
    }
}

impl Fsm for KvFsm {
    fn apply(&mut self, entry: &LogEntry) -> Result<(), FsmError> {
        let command = Command::decode(&entry.data)
            .map_err(|e| FsmError::new(format!("undecodable command at index {}: {e}", entry.index)))?;
        match command {
            Command::Set { key, value } => self
                .storer
                .set(&key, &value)
                .map_err(|e| FsmError::new(e.to_string())),
            Command::Delete { key } => self
                .storer
                .delete(&key)
                .map_err(|e| FsmError::new(e.to_string())),
        }
    }

    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>, FsmError> {
        // The dump is taken here; serialization happens later without
        // holding any lock on the live map.
        Ok(Box::new(KvSnapshot {
            entries: self.storer.dump(),
        }))
    }

    fn restore(&mut self, reader: &mut dyn Read) -> Result<(), FsmError> {
        self.storer.clear();
        let mut records = SnapshotReader::new(reader);
        loop {
            match records.read_record() {
                Ok(Some((key, value))) => self
                    .storer
                    .set(&key, &value)
                    .map_err(|e| FsmError::new(e.to_string()))?,
                Ok(None) => return Ok(()),
                Err(e) => return Err(FsmError::new(format!("snapshot restore: {e}"))),
            }
        }
    }
}

/// A consistent dump awaiting serialization.
struct KvSnapshot {
    entries: BTreeMap<String, String>,
}

impl FsmSnapshot for KvSnapshot {
    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<(), FsmError> {
        let result: Result<(), dkv_wire::WireError> = (|| {
            let mut writer = SnapshotWriter::new(&mut *sink);
            for (key, value) in &self.entries {
                writer.write_record(key, value)?;
            }
            writer.finish()?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = sink.cancel();
            return Err(FsmError::new(format!("snapshot persist: {e}")));
        }
        Ok(())
    }
}
