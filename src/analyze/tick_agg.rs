//! Reference tick aggregator: sums numeric payload fields per tick.
//!
//! Spill frames are snap-compressed JSON with a magic header and crc32,
//! fsynced so spill state survives a process restart. `collect` folds
//! every frame back in, so disk plus subsequent adds always reproduce the
//! uninterrupted result.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;

use crc32fast::Hasher;
use serde_json::Value;
use tracing::debug;

use super::{Aggregator, SpillCleaner, SpillState};
use crate::error::{EngineError, Result};
use crate::model::{Tc, TickData};

const SPILL_MAGIC: &[u8; 8] = b"GMSPILL\0";
const SPILL_VERSION: u16 = 1;

type TickState = BTreeMap<u32, BTreeMap<String, i64>>;

/// Sums integer payload fields per tick; the standard aggregator shape for
/// counting leaves.
pub struct TickSumAggregator {
    state: TickState,
    spill_dir: PathBuf,
    spill_count: u64,
}

impl TickSumAggregator {
    /// Aggregator spilling into `spill_dir` (created on first spill).
    pub fn new(spill_dir: PathBuf) -> Self {
        Self {
            state: TickState::new(),
            spill_dir,
            spill_count: 0,
        }
    }

    /// Cleaner that removes the spill directory.
    pub fn cleaner(&self) -> SpillDirCleaner {
        SpillDirCleaner {
            dir: self.spill_dir.clone(),
        }
    }

    fn frame_path(&self, index: u64) -> PathBuf {
        self.spill_dir.join(format!("frame-{index:06}.bin"))
    }

    fn merge_state(into: &mut TickState, from: TickState) {
        for (tick, fields) in from {
            let entry = into.entry(tick).or_default();
            for (key, value) in fields {
                *entry.entry(key).or_insert(0) += value;
            }
        }
    }
}

impl Aggregator for TickSumAggregator {
    fn add(&mut self, tc: &Tc) -> Result<()> {
        let Some(Value::Object(fields)) = &tc.payload else {
            return Err(EngineError::Aggregator(
                "tick-sum aggregator expects an object payload".into(),
            ));
        };
        let entry = self.state.entry(tc.tick).or_default();
        for (key, value) in fields {
            let Some(number) = value.as_i64() else {
                return Err(EngineError::Aggregator(format!(
                    "payload field {key} is not an integer"
                )));
            };
            *entry.entry(key.clone()).or_insert(0) += number;
        }
        Ok(())
    }

    fn flush_tick(&mut self, tick: u32) -> Result<Option<TickData>> {
        Ok(self.state.remove(&tick).map(|fields| TickData {
            tick,
            data: fields_to_value(fields),
        }))
    }

    fn flush_all(&mut self) -> Result<Vec<TickData>> {
        let state = std::mem::take(&mut self.state);
        Ok(state
            .into_iter()
            .map(|(tick, fields)| TickData {
                tick,
                data: fields_to_value(fields),
            })
            .collect())
    }

    fn spill(&mut self) -> Result<u64> {
        if self.state.is_empty() {
            return Ok(0);
        }
        fs::create_dir_all(&self.spill_dir)?;

        let state = std::mem::take(&mut self.state);
        let raw = serde_json::to_vec(&state)
            .map_err(|e| EngineError::Aggregator(format!("spill serialization failed: {e}")))?;
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&raw)
            .map_err(|e| EngineError::Aggregator(format!("spill compression failed: {e}")))?;

        let mut hasher = Hasher::new();
        hasher.update(&compressed);
        let crc = hasher.finalize();

        let path = self.frame_path(self.spill_count);
        let mut file = File::create(&path)?;
        file.write_all(SPILL_MAGIC)?;
        file.write_all(&SPILL_VERSION.to_le_bytes())?;
        file.write_all(&(compressed.len() as u32).to_le_bytes())?;
        file.write_all(&crc.to_le_bytes())?;
        file.write_all(&compressed)?;
        file.sync_data()?;

        self.spill_count += 1;
        let bytes = (SPILL_MAGIC.len() + 2 + 4 + 4 + compressed.len()) as u64;
        debug!(frame = self.spill_count - 1, bytes, "aggregator spilled");
        Ok(bytes)
    }

    fn collect(&mut self) -> Result<()> {
        for index in 0..self.spill_count {
            let path = self.frame_path(index);
            let mut file = File::open(&path)?;

            let mut magic = [0u8; 8];
            file.read_exact(&mut magic)?;
            if &magic != SPILL_MAGIC {
                return Err(EngineError::Corruption(format!(
                    "bad spill magic in {}",
                    path.display()
                )));
            }
            let mut version = [0u8; 2];
            file.read_exact(&mut version)?;
            if u16::from_le_bytes(version) != SPILL_VERSION {
                return Err(EngineError::Corruption(format!(
                    "unsupported spill version in {}",
                    path.display()
                )));
            }
            let mut len_buf = [0u8; 4];
            file.read_exact(&mut len_buf)?;
            let mut crc_buf = [0u8; 4];
            file.read_exact(&mut crc_buf)?;
            let mut compressed = vec![0u8; u32::from_le_bytes(len_buf) as usize];
            file.read_exact(&mut compressed)?;

            let mut hasher = Hasher::new();
            hasher.update(&compressed);
            if hasher.finalize() != u32::from_le_bytes(crc_buf) {
                return Err(EngineError::Corruption(format!(
                    "spill frame checksum mismatch in {}",
                    path.display()
                )));
            }

            let raw = snap::raw::Decoder::new()
                .decompress_vec(&compressed)
                .map_err(|e| EngineError::Corruption(format!("spill decompression failed: {e}")))?;
            let frame: TickState = serde_json::from_slice(&raw)
                .map_err(|e| EngineError::Corruption(format!("spill frame malformed: {e}")))?;
            Self::merge_state(&mut self.state, frame);
        }
        Ok(())
    }

    fn estimated_state_size(&self) -> u64 {
        // Conservative: node overhead plus keys, doubled.
        let mut bytes = 0u64;
        for fields in self.state.values() {
            bytes += 64;
            for key in fields.keys() {
                bytes += key.len() as u64 + 32;
            }
        }
        bytes * 2
    }

    fn spill_state(&self) -> SpillState {
        SpillState {
            dir: self.spill_dir.clone(),
            count: self.spill_count,
        }
    }

    fn restore_spill_state(&mut self, state: &SpillState) -> Result<()> {
        if state.count > 0 && !state.dir.is_dir() {
            return Err(EngineError::Aggregator(format!(
                "spill directory {} is missing",
                state.dir.display()
            )));
        }
        self.spill_dir = state.dir.clone();
        self.spill_count = state.count;
        Ok(())
    }

    fn discard_state(&mut self) -> Result<()> {
        self.state.clear();
        self.spill_count = 0;
        if self.spill_dir.exists() {
            fs::remove_dir_all(&self.spill_dir)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.spill_dir.exists() {
            fs::remove_dir_all(&self.spill_dir)?;
        }
        Ok(())
    }
}

fn fields_to_value(fields: BTreeMap<String, i64>) -> Value {
    Value::Object(
        fields
            .into_iter()
            .map(|(key, value)| (key, Value::from(value)))
            .collect(),
    )
}

/// Removes an aggregator spill directory on any exit path.
pub struct SpillDirCleaner {
    /// Directory to remove.
    pub dir: PathBuf,
}

impl SpillCleaner for SpillDirCleaner {
    fn cleanup_spills(&self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectHash;

    fn tc(tick: u32, added: i64) -> Tc {
        Tc {
            commit_hash: ObjectHash::ZERO,
            tick,
            author_id: 0,
            timestamp: 0,
            payload: Some(serde_json::json!({ "added": added })),
        }
    }

    #[test]
    fn adds_sum_per_tick_and_flush_is_ascending() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let mut agg = TickSumAggregator::new(dir.path().join("a"));
        agg.add(&tc(3, 5)).expect("add");
        agg.add(&tc(1, 2)).expect("add");
        agg.add(&tc(3, 7)).expect("add");
        let ticks = agg.flush_all().expect("flush");
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].tick, 1);
        assert_eq!(ticks[1].tick, 3);
        assert_eq!(ticks[1].data["added"], 12);
    }

    #[test]
    fn non_object_payload_is_rejected_without_corrupting_state() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let mut agg = TickSumAggregator::new(dir.path().join("a"));
        agg.add(&tc(0, 1)).expect("add");
        let mut bad = tc(0, 0);
        bad.payload = Some(Value::from(17));
        assert!(agg.add(&bad).is_err());
        let ticks = agg.flush_all().expect("flush");
        assert_eq!(ticks[0].data["added"], 1);
    }

    #[test]
    fn spill_then_collect_reproduces_unspilled_result() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let mut agg = TickSumAggregator::new(dir.path().join("a"));
        agg.add(&tc(0, 10)).expect("add");
        let bytes = agg.spill().expect("spill");
        assert!(bytes > 0);
        assert_eq!(agg.estimated_state_size(), 0);
        agg.add(&tc(0, 5)).expect("add after spill");
        agg.add(&tc(2, 1)).expect("add after spill");
        agg.collect().expect("collect");
        let ticks = agg.flush_all().expect("flush");
        assert_eq!(ticks[0].data["added"], 15);
        assert_eq!(ticks[1].data["added"], 1);
    }

    #[test]
    fn spill_state_survives_a_new_instance() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let spill_dir = dir.path().join("a");
        let state = {
            let mut agg = TickSumAggregator::new(spill_dir.clone());
            agg.add(&tc(1, 4)).expect("add");
            agg.spill().expect("spill");
            agg.spill_state()
        };
        assert_eq!(state.count, 1);

        let mut restored = TickSumAggregator::new(PathBuf::from("/nonexistent"));
        restored.restore_spill_state(&state).expect("restore");
        restored.collect().expect("collect");
        let ticks = restored.flush_all().expect("flush");
        assert_eq!(ticks[0].data["added"], 4);
    }

    #[test]
    fn empty_spill_writes_nothing() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let mut agg = TickSumAggregator::new(dir.path().join("a"));
        assert_eq!(agg.spill().expect("spill"), 0);
        assert_eq!(agg.spill_state().count, 0);
    }

    #[test]
    fn discard_removes_disk_state() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let spill_dir = dir.path().join("a");
        let mut agg = TickSumAggregator::new(spill_dir.clone());
        agg.add(&tc(0, 1)).expect("add");
        agg.spill().expect("spill");
        assert!(spill_dir.is_dir());
        agg.discard_state().expect("discard");
        assert!(!spill_dir.exists());
    }
}
