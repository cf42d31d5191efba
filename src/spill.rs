//! Durable spill queue
//!
//! When the hub is unreachable, batches of events spill to disk and are
//! drained back into the uplink after reconnection. Storage is a directory
//! of numbered segment files; each record is `[len][crc32c][json]` where
//! the json payload carries `{ write_time, event }`. A partially written
//! tail record is truncated on open, so a record is either fully present
//! or absent.
//!
//! Producers hand batches to an intake channel and never block on disk;
//! a dedicated worker owns all writes.

use crate::models::DebugEvent;
use anyhow::{anyhow, Context};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const SEGMENT_PREFIX: &str = "spill-";
const SEGMENT_SUFFIX: &str = ".log";
const SEGMENT_MAX_RECORDS: usize = 512;
const RECORD_HEADER_LEN: usize = 8;
/// Guard against absurd length prefixes when scanning damaged files.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SpillConfig {
    pub max_queue_size: usize,
    pub max_retention: Duration,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100_000,
            max_retention: Duration::from_secs(3 * 24 * 60 * 60),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SpillRecord {
    write_time: i64,
    event: DebugEvent,
}

struct Segment {
    seq: u64,
    path: PathBuf,
    records: usize,
}

struct Store {
    dir: PathBuf,
    segments: VecDeque<Segment>,
    next_seq: u64,
    max_queue_size: usize,
}

enum Intake {
    Batch(Vec<DebugEvent>),
    Sync(oneshot::Sender<()>),
}

/// Handle to the on-disk spill queue. Cloneable; the worker exits when the
/// last handle drops.
#[derive(Clone)]
pub struct SpillQueue {
    intake: mpsc::UnboundedSender<Intake>,
    store: Arc<Mutex<Store>>,
    count: Arc<AtomicUsize>,
}

impl SpillQueue {
    /// Open (or create) the spill directory, truncate any partial tail
    /// record and evict records past retention.
    pub fn open(dir: &Path, config: SpillConfig) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating spill directory {:?}", dir))?;

        let mut store = Store {
            dir: dir.to_path_buf(),
            segments: VecDeque::new(),
            next_seq: 0,
            max_queue_size: config.max_queue_size.max(1),
        };
        let recovered = store.scan(config.max_retention)?;
        if recovered > 0 {
            tracing::info!(records = recovered, "recovered spilled events from disk");
        }

        let count = Arc::new(AtomicUsize::new(recovered));
        let store = Arc::new(Mutex::new(store));
        let (tx, rx) = mpsc::unbounded_channel();

        let worker_store = Arc::clone(&store);
        let worker_count = Arc::clone(&count);
        tokio::spawn(worker_loop(rx, worker_store, worker_count));

        Ok(Self {
            intake: tx,
            store,
            count,
        })
    }

    /// Queue a batch for persistence. Returns immediately; the worker
    /// appends to disk and enforces the size cap.
    pub fn enqueue(&self, batch: Vec<DebugEvent>) {
        if batch.is_empty() {
            return;
        }
        self.count.fetch_add(batch.len(), Ordering::SeqCst);
        if self.intake.send(Intake::Batch(batch)).is_err() {
            tracing::warn!("spill worker gone; dropping batch");
        }
    }

    /// Observable queue length (pending intake included).
    pub fn queue_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Remove and return up to `max_count` events from the head.
    pub async fn dequeue_batch(&self, max_count: usize) -> anyhow::Result<Vec<DebugEvent>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let store = Arc::clone(&self.store);
        let count = Arc::clone(&self.count);
        tokio::task::spawn_blocking(move || {
            let mut store = store.lock().expect("spill mutex poisoned");
            let events = store.take_head(max_count)?;
            count.fetch_sub(events.len(), Ordering::SeqCst);
            Ok(events)
        })
        .await?
    }

    /// Wait until every batch handed over so far has reached disk.
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        if self.intake.send(Intake::Sync(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn worker_loop(
    mut rx: mpsc::UnboundedReceiver<Intake>,
    store: Arc<Mutex<Store>>,
    count: Arc<AtomicUsize>,
) {
    while let Some(intake) = rx.recv().await {
        match intake {
            Intake::Batch(batch) => {
                let store = Arc::clone(&store);
                let count = Arc::clone(&count);
                let result = tokio::task::spawn_blocking(move || {
                    let mut store = store.lock().expect("spill mutex poisoned");
                    store.append(&batch)?;
                    let evicted = store.enforce_cap()?;
                    if evicted > 0 {
                        count.fetch_sub(evicted, Ordering::SeqCst);
                        tracing::debug!(evicted, "spill queue evicted oldest records");
                    }
                    Ok::<_, anyhow::Error>(())
                })
                .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!("spill append failed: {e:#}"),
                    Err(e) => tracing::error!("spill worker task failed: {e}"),
                }
            }
            Intake::Sync(tx) => {
                let _ = tx.send(());
            }
        }
    }
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{seq:08}{SEGMENT_SUFFIX}"))
}

pub(crate) fn encode_record(write_time: i64, event: &DebugEvent) -> Vec<u8> {
    let payload = serde_json::to_vec(&SpillRecord {
        write_time,
        event: event.clone(),
    })
    .expect("spill record serializes");
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

/// Decode records from a segment buffer. Returns the parsed records and the
/// byte length of the valid prefix; anything after it is a damaged tail.
fn decode_records(data: &[u8]) -> (Vec<(i64, DebugEvent)>, usize) {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while data.len() - offset >= RECORD_HEADER_LEN {
        let len = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let crc = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        if len > MAX_RECORD_LEN || data.len() - offset - RECORD_HEADER_LEN < len {
            break;
        }
        let payload = &data[offset + RECORD_HEADER_LEN..offset + RECORD_HEADER_LEN + len];
        if crc32c::crc32c(payload) != crc {
            break;
        }
        match serde_json::from_slice::<SpillRecord>(payload) {
            Ok(record) => records.push((record.write_time, record.event)),
            Err(_) => break,
        }
        offset += RECORD_HEADER_LEN + len;
    }
    (records, offset)
}

impl Store {
    /// Scan the directory on open: index segments, truncate damaged tails,
    /// evict records past retention. Returns the surviving record count.
    fn scan(&mut self, retention: Duration) -> anyhow::Result<usize> {
        let mut seqs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name
                .strip_prefix(SEGMENT_PREFIX)
                .and_then(|s| s.strip_suffix(SEGMENT_SUFFIX))
            {
                if let Ok(seq) = stem.parse::<u64>() {
                    seqs.push(seq);
                }
            }
        }
        seqs.sort_unstable();

        let cutoff = Utc::now().timestamp_millis() - retention.as_millis() as i64;
        let mut total = 0usize;
        for seq in seqs {
            let path = segment_path(&self.dir, seq);
            let data = fs::read(&path)
                .with_context(|| format!("reading spill segment {:?}", path))?;
            let (records, valid_len) = decode_records(&data);
            if valid_len < data.len() {
                tracing::warn!(
                    segment = seq,
                    dropped_bytes = data.len() - valid_len,
                    "truncating partial spill record"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(valid_len as u64)?;
                file.sync_all()?;
            }

            let original = records.len();
            let fresh: Vec<(i64, DebugEvent)> = records
                .into_iter()
                .filter(|(write_time, _)| *write_time >= cutoff)
                .collect();
            if fresh.is_empty() {
                fs::remove_file(&path)?;
                continue;
            }
            let kept = fresh.len();
            if kept < original {
                self.rewrite_segment(&path, &fresh)?;
            }
            self.segments.push_back(Segment {
                seq,
                path,
                records: kept,
            });
            total += kept;
            self.next_seq = self.next_seq.max(seq + 1);
        }
        Ok(total)
    }

    fn rewrite_segment(&self, path: &Path, records: &[(i64, DebugEvent)]) -> anyhow::Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            for (write_time, event) in records {
                file.write_all(&encode_record(*write_time, event))?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn append(&mut self, batch: &[DebugEvent]) -> anyhow::Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut remaining = batch;
        while !remaining.is_empty() {
            let room = match self.segments.back() {
                Some(active) if active.records < SEGMENT_MAX_RECORDS => {
                    SEGMENT_MAX_RECORDS - active.records
                }
                _ => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    let path = segment_path(&self.dir, seq);
                    self.segments.push_back(Segment {
                        seq,
                        path,
                        records: 0,
                    });
                    SEGMENT_MAX_RECORDS
                }
            };
            let take = remaining.len().min(room);
            let (chunk, rest) = remaining.split_at(take);
            let active = self.segments.back_mut().expect("active segment exists");
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&active.path)?;
            for event in chunk {
                file.write_all(&encode_record(now, event))?;
            }
            file.sync_all()?;
            active.records += take;
            remaining = rest;
        }
        Ok(())
    }

    fn total_records(&self) -> usize {
        self.segments.iter().map(|s| s.records).sum()
    }

    /// Drop oldest records past `max_queue_size`. Returns how many went.
    fn enforce_cap(&mut self) -> anyhow::Result<usize> {
        let total = self.total_records();
        if total <= self.max_queue_size {
            return Ok(0);
        }
        let excess = total - self.max_queue_size;
        self.drop_head(excess)?;
        Ok(excess)
    }

    /// Remove `n` records from the head of the queue.
    fn drop_head(&mut self, mut n: usize) -> anyhow::Result<()> {
        while n > 0 {
            let Some(front) = self.segments.front() else {
                break;
            };
            if front.records <= n {
                n -= front.records;
                fs::remove_file(&front.path)
                    .with_context(|| format!("removing spill segment {:?}", front.path))?;
                self.segments.pop_front();
            } else {
                let path = front.path.clone();
                let data = fs::read(&path)?;
                let (records, _) = decode_records(&data);
                self.rewrite_segment(&path, &records[n..])?;
                let front = self.segments.front_mut().expect("front segment exists");
                front.records -= n;
                n = 0;
            }
        }
        Ok(())
    }

    /// Read and remove up to `max_count` events from the head.
    fn take_head(&mut self, max_count: usize) -> anyhow::Result<Vec<DebugEvent>> {
        let mut out = Vec::new();
        for segment in &self.segments {
            if out.len() >= max_count {
                break;
            }
            let data = fs::read(&segment.path)?;
            let (records, _) = decode_records(&data);
            if records.len() != segment.records {
                return Err(anyhow!(
                    "spill segment {:?} holds {} records, index says {}",
                    segment.path,
                    records.len(),
                    segment.records
                ));
            }
            for (_, event) in records {
                if out.len() >= max_count {
                    break;
                }
                out.push(event);
            }
        }
        self.drop_head(out.len())?;
        Ok(out)
    }
}
