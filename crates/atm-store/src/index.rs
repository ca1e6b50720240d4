//! Snapshot index and its on-disk journal
//!
//! The index lives in memory as an [`IndexState`]; durability comes from an
//! append-only JSON-lines journal ([`IndexLog`]) that is replayed on open.
//! Every mutation is journaled before it is applied in memory, so anything a
//! reader can see has already been flushed.

use crate::error::{StoreError, StoreResult};
use crate::record::SnapshotRecord;
use atm_state::{Fact, RunId, SnapshotId, ToolCallRecord};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One journaled index mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub(crate) enum IndexEvent {
    /// Snapshot committed, with the facts it introduced over its parent.
    /// Also moves the run's head to it.
    Snapshot {
        record: SnapshotRecord,
        facts: Vec<Fact>,
    },
    /// Head pointer moved
    Head {
        run_id: RunId,
        snapshot_id: SnapshotId,
    },
    /// Tool calls appended to a run's ledger
    ToolCalls {
        run_id: RunId,
        calls: Vec<ToolCallRecord>,
    },
    /// Snapshots collected
    Removed { ids: Vec<SnapshotId> },
}

/// In-memory index
#[derive(Debug, Clone, Default)]
pub(crate) struct IndexState {
    pub(crate) records: HashMap<SnapshotId, SnapshotRecord>,
    /// Timeline per run, ordered by creation time
    pub(crate) by_run: HashMap<RunId, BTreeSet<(DateTime<Utc>, SnapshotId)>>,
    pub(crate) heads: HashMap<RunId, SnapshotId>,
    pub(crate) ledger: HashMap<RunId, Vec<ToolCallRecord>>,
    pub(crate) facts: HashMap<RunId, Vec<(SnapshotId, Fact)>>,
    /// Bumped on every mutation; GC commits only against the generation it read
    pub(crate) generation: u64,
}

impl IndexState {
    /// Apply one event
    pub(crate) fn apply(&mut self, event: IndexEvent) {
        match event {
            IndexEvent::Snapshot { record, facts } => {
                self.by_run
                    .entry(record.run_id)
                    .or_default()
                    .insert((record.created_at, record.id));
                self.heads.insert(record.run_id, record.id);
                self.facts
                    .entry(record.run_id)
                    .or_default()
                    .extend(facts.into_iter().map(|f| (record.id, f)));
                self.records.insert(record.id, record);
            }
            IndexEvent::Head {
                run_id,
                snapshot_id,
            } => {
                self.heads.insert(run_id, snapshot_id);
            }
            IndexEvent::ToolCalls { run_id, calls } => {
                self.ledger.entry(run_id).or_default().extend(calls);
            }
            IndexEvent::Removed { ids } => {
                let removed: HashSet<SnapshotId> = ids.into_iter().collect();
                for id in &removed {
                    if let Some(record) = self.records.remove(id) {
                        if let Some(timeline) = self.by_run.get_mut(&record.run_id) {
                            timeline.remove(&(record.created_at, record.id));
                        }
                    }
                }
                self.by_run.retain(|_, timeline| !timeline.is_empty());
                for facts in self.facts.values_mut() {
                    facts.retain(|(id, _)| !removed.contains(id));
                }
            }
        }
        self.generation += 1;
    }

    /// Ancestor chain of `id`, starting at `id` itself, ending at the root.
    ///
    /// Stops early if an ancestor is missing from the index.
    pub(crate) fn chain(&self, id: SnapshotId) -> Vec<&SnapshotRecord> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            match self.records.get(&current) {
                Some(record) => {
                    chain.push(record);
                    cursor = record.parent_id;
                }
                None => break,
            }
        }
        chain
    }
}

/// Append-only JSON-lines journal of [`IndexEvent`]s
#[derive(Debug)]
pub(crate) struct IndexLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl IndexLog {
    /// Open the journal, returning it with the events it already holds.
    ///
    /// A final line that does not parse is a torn write: it is dropped and the
    /// file truncated to the last complete event. A bad line anywhere else is
    /// corruption.
    pub(crate) fn open(path: impl Into<PathBuf>) -> StoreResult<(Self, Vec<IndexEvent>)> {
        let path = path.into();
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let (events, valid_len, needs_newline) = Self::replay(&content)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        if valid_len < content.len() {
            tracing::warn!(
                path = %path.display(),
                dropped = content.len() - valid_len,
                "ignoring torn final index line"
            );
            file.set_len(valid_len as u64)
                .map_err(|e| StoreError::io(&path, e))?;
        }
        if needs_newline {
            file.write_all(b"\n").map_err(|e| StoreError::io(&path, e))?;
        }

        Ok((
            Self {
                path,
                file: Mutex::new(file),
            },
            events,
        ))
    }

    /// Parse journal bytes: events, length of the valid prefix, and whether
    /// the valid prefix ends without a newline
    fn replay(content: &[u8]) -> StoreResult<(Vec<IndexEvent>, usize, bool)> {
        let lines: Vec<&[u8]> = content.split(|b| *b == b'\n').collect();
        let last_nonblank = lines
            .iter()
            .rposition(|line| !is_blank(line));

        let mut events = Vec::new();
        let mut offset = 0;
        let mut valid_len = 0;
        let mut needs_newline = false;
        for (i, line) in lines.iter().enumerate() {
            let line_end = offset + line.len();
            let has_newline = line_end < content.len();
            if !is_blank(line) {
                match serde_json::from_slice::<IndexEvent>(line) {
                    Ok(event) => {
                        events.push(event);
                        valid_len = if has_newline { line_end + 1 } else { line_end };
                        needs_newline = !has_newline;
                    }
                    Err(_) if Some(i) == last_nonblank => break,
                    Err(e) => {
                        return Err(StoreError::CorruptIndex {
                            line: i + 1,
                            reason: e.to_string(),
                        })
                    }
                }
            } else if has_newline {
                valid_len = line_end + 1;
            }
            offset = line_end + 1;
        }
        Ok((events, valid_len, needs_newline))
    }

    /// Append and flush one event
    pub(crate) fn append(&self, event: &IndexEvent) -> StoreResult<()> {
        let mut line = serde_json::to_vec(event).map_err(|e| StoreError::CorruptIndex {
            line: 0,
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&line)
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.flush().map_err(|e| StoreError::io(&self.path, e))?;
        file.sync_data().map_err(|e| StoreError::io(&self.path, e))
    }

    /// Journal path
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ReplayHandles, SnapshotEncoding};
    use atm_state::ContentHash;
    use std::collections::BTreeMap;

    fn head_event() -> IndexEvent {
        IndexEvent::Head {
            run_id: RunId::new(),
            snapshot_id: SnapshotId::new(),
        }
    }

    #[test]
    fn journal_replays_appended_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.jsonl");
        {
            let (log, events) = IndexLog::open(&path).unwrap();
            assert!(events.is_empty());
            log.append(&head_event()).unwrap();
            log.append(&head_event()).unwrap();
        }
        let (_, events) = IndexLog::open(&path).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn torn_final_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.jsonl");
        {
            let (log, _) = IndexLog::open(&path).unwrap();
            log.append(&head_event()).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"event":"head","run_"#).unwrap();
        drop(file);

        let (log, events) = IndexLog::open(&path).unwrap();
        assert_eq!(events.len(), 1);
        log.append(&head_event()).unwrap();
        drop(log);

        let (_, events) = IndexLog::open(&path).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn bad_middle_line_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.jsonl");
        let good = serde_json::to_string(&head_event()).unwrap();
        fs::write(&path, format!("{good}\nnot json\n{good}\n")).unwrap();

        let err = IndexLog::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::CorruptIndex { line: 2, .. }));
    }

    #[test]
    fn removed_event_prunes_timeline_and_facts() {
        let run = RunId::new();
        let blob = ContentHash::compute(b"state");
        let record = SnapshotRecord {
            id: SnapshotId::new(),
            run_id: run,
            parent_id: None,
            state_digest: blob,
            encoding: SnapshotEncoding::Full { blob },
            is_milestone: true,
            created_at: Utc::now(),
            replay: ReplayHandles {
                seed: 0,
                temperature: 0.7,
                template_hashes: BTreeMap::new(),
            },
        };
        let id = record.id;

        let mut state = IndexState::default();
        state.apply(IndexEvent::Snapshot {
            record,
            facts: vec![Fact::new("parcel", "city", "Seattle", blob)],
        });
        assert_eq!(state.facts[&run].len(), 1);

        state.apply(IndexEvent::Removed { ids: vec![id] });
        assert!(state.records.is_empty());
        assert!(state.by_run.is_empty());
        assert!(state.facts[&run].is_empty());
        assert_eq!(state.generation, 2);
    }
}
