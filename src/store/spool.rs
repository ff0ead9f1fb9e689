use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::interval;
use tracing::{error, info, warn};

use crate::store::gateway::StoreGateway;
use crate::types::TradeRow;

/// Append-only line-delimited JSON journal for trade batches the store
/// rejected. One trade row per line, UTF-8.
pub struct Spool {
    path: PathBuf,
    /// Serializes append vs replay-rewrite on the file.
    lock: Mutex<()>,
}

impl Spool {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a batch verbatim. Each row becomes one JSON line.
    pub fn append_batch(&self, rows: &[TradeRow]) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut buf = String::new();
        for row in rows {
            match serde_json::to_string(row) {
                Ok(line) => {
                    buf.push_str(&line);
                    buf.push('\n');
                }
                Err(e) => warn!("spool: unserializable trade {}: {e}", row.id),
            }
        }
        file.write_all(buf.as_bytes())?;
        file.flush()
    }

    /// Read every journal line. Returns `(line_count_read, parsed_rows)`;
    /// malformed lines are dropped with a log, never replayed.
    pub fn read_all(&self) -> std::io::Result<(usize, Vec<TradeRow>)> {
        let _guard = self.lock.lock().unwrap();
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, Vec::new())),
            Err(e) => return Err(e),
        };
        let mut rows = Vec::new();
        let mut count = 0usize;
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            count += 1;
            match serde_json::from_str::<TradeRow>(line) {
                Ok(row) => rows.push(row),
                Err(e) => warn!("spool: dropping malformed line: {e}"),
            }
        }
        Ok((count, rows))
    }

    /// Atomically rewrite the journal: the surviving rows from the replayed
    /// prefix, followed by any lines appended while the replay ran.
    pub fn rewrite(&self, processed_lines: usize, remaining: &[TradeRow]) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let content = fs::read_to_string(&self.path).unwrap_or_default();
        let tail: Vec<&str> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .skip(processed_lines)
            .collect();

        let mut buf = String::new();
        for row in remaining {
            if let Ok(line) = serde_json::to_string(row) {
                buf.push_str(&line);
                buf.push('\n');
            }
        }
        for line in tail {
            buf.push_str(line);
            buf.push('\n');
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, buf.as_bytes())?;
        fs::rename(&tmp, &self.path)
    }

    pub fn backlog(&self) -> usize {
        self.read_all().map(|(n, _)| n).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Replayer
// ---------------------------------------------------------------------------

/// Periodic loop that drains the spool back into the store. Duplicate-key
/// responses count as success; transient failures leave the line in place
/// for the next pass.
pub struct SpoolReplayer {
    spool: Arc<Spool>,
    store: Arc<StoreGateway>,
    replay_ms: u64,
    log_retry: bool,
}

impl SpoolReplayer {
    pub fn new(spool: Arc<Spool>, store: Arc<StoreGateway>, replay_ms: u64, log_retry: bool) -> Self {
        Self { spool, store, replay_ms, log_retry }
    }

    pub async fn run(self) {
        let mut ticker = interval(Duration::from_millis(self.replay_ms));
        ticker.tick().await; // consume immediate first tick

        loop {
            ticker.tick().await;
            if let Err(e) = self.replay_once().await {
                error!("spool replay failed: {e}");
            }
        }
    }

    pub async fn replay_once(&self) -> std::io::Result<()> {
        let (line_count, rows) = self.spool.read_all()?;
        if line_count == 0 {
            return Ok(());
        }

        let mut remaining = Vec::new();
        let mut replayed = 0usize;
        for row in rows {
            match self.store.insert_one("trades", &row).await {
                Ok(()) => replayed += 1,
                Err(e) if e.is_duplicate() => replayed += 1,
                Err(e) if e.is_transient() => {
                    remaining.push(row);
                }
                Err(e) => {
                    // Permanent: keep the line and keep shouting. Dropping it
                    // silently would violate the never-drop contract.
                    warn!("spool replay permanent failure for {}: {e}", row.id);
                    remaining.push(row);
                }
            }
        }

        self.spool.rewrite(line_count, &remaining)?;
        if self.log_retry {
            info!(
                replayed,
                kept = remaining.len(),
                "spool replay pass: {replayed} drained, {} kept",
                remaining.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn row(id: &str) -> TradeRow {
        TradeRow {
            id: id.to_string(),
            market_id: "m1".to_string(),
            outcome: "Yes".to_string(),
            outcome_index: 0,
            price: 0.5,
            size: 10.0,
            side: Side::Buy,
            ts: "2026-08-01T00:00:00.000Z".to_string(),
            slug: None,
            title: None,
            event_slug: None,
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path().join("spool.jsonl"));

        spool.append_batch(&[row("t1"), row("t2")]).unwrap();
        spool.append_batch(&[row("t3")]).unwrap();

        let (count, rows) = spool.read_all().unwrap();
        assert_eq!(count, 3);
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn rewrite_keeps_failures_and_concurrent_tail() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path().join("spool.jsonl"));

        spool.append_batch(&[row("t1"), row("t2")]).unwrap();
        // Both lines were read for replay; t3 lands mid-replay; t2 failed.
        spool.append_batch(&[row("t3")]).unwrap();
        spool.rewrite(2, &[row("t2")]).unwrap();

        let (count, rows) = spool.read_all().unwrap();
        assert_eq!(count, 2);
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t3"]);

        // Fully drained journal rewrites to empty.
        spool.rewrite(2, &[]).unwrap();
        assert_eq!(spool.backlog(), 0);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path().join("absent.jsonl"));
        let (count, rows) = spool.read_all().unwrap();
        assert_eq!(count, 0);
        assert!(rows.is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped_but_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spool.jsonl");
        std::fs::write(&path, "not-json\n").unwrap();
        let spool = Spool::new(path);
        spool.append_batch(&[row("t1")]).unwrap();

        let (count, rows) = spool.read_all().unwrap();
        assert_eq!(count, 2);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "t1");
    }
}
