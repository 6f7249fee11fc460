// ===============================
// src/recorder.rs
// ===============================
//
// Audit log untuk trade & equity (append-only JSONL):
// - trades.jsonl  : {id, time, bot_name, symbol, side, size, price, cash_after, position_after}
// - equity.jsonl  : {id, time, bot_name, equity, realized_pnl, unrealized_pnl}
// - Tick loop mengirim batch lewat channel (fire-and-forget), task ini yang menulis.
// - Jika tulis gagal, record tetap di antrean pending dan dicoba lagi pada
//   batch berikutnya / flush periodik. Record baru keluar dari antrean
//   setelah flush sukses; baris setengah jadi dipotong sebelum retry.
// - Id per relasi dilanjutkan dari jumlah baris yang sudah ada di file.
//
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::Record;
use crate::metrics::{PERSIST_FAILURES, PERSIST_PENDING};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Durable append-only destination for trade and equity records.
///
/// `append` stages a record, `flush` commits everything staged. When either
/// returns an error, every record staged since the last successful flush is
/// discarded by the sink, so the caller can hand them in again.
#[async_trait]
pub trait PersistenceSink: Send {
    async fn append(&mut self, record: &Record) -> Result<(), PersistenceError>;
    async fn flush(&mut self) -> Result<(), PersistenceError>;
}

#[derive(Serialize)]
struct Row<'a, T: Serialize> {
    id: u64,
    #[serde(flatten)]
    record: &'a T,
}

// Satu file relasi. Baris yang sudah ditulis tapi belum di-flush bersifat
// "staged": kalau write/flush gagal, rollback membuang staged rows dan
// memotong file kembali ke panjang terakhir yang committed.
struct Relation {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    next_id: u64,
    committed_id: u64,
    committed_len: u64,
    staged_len: u64,
}

impl Relation {
    async fn open(path: PathBuf) -> Result<Self, PersistenceError> {
        let next_id = count_lines(&path).await? + 1;
        let committed_len = match fs::metadata(&path).await {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let mut rel = Self {
            path,
            writer: None,
            next_id,
            committed_id: next_id,
            committed_len,
            staged_len: 0,
        };
        rel.reopen().await?;
        Ok(rel)
    }

    async fn reopen(&mut self) -> Result<(), PersistenceError> {
        let file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        // buang sisa baris setengah jadi dari percobaan yang gagal
        if file.metadata().await?.len() > self.committed_len {
            file.set_len(self.committed_len).await?;
        }
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    async fn write_line<T: Serialize + Sync>(&mut self, record: &T) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_string(&Row { id: self.next_id, record })?;
        line.push('\n');
        if self.writer.is_none() {
            self.reopen().await?;
        }
        if let Some(w) = self.writer.as_mut() {
            w.write_all(line.as_bytes()).await?;
        }
        self.next_id += 1;
        self.staged_len += line.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), PersistenceError> {
        if let Some(w) = self.writer.as_mut() {
            w.flush().await?;
        }
        Ok(())
    }

    /// Marks staged rows as committed. Only after every relation flushed.
    fn commit(&mut self) {
        self.committed_len += self.staged_len;
        self.staged_len = 0;
        self.committed_id = self.next_id;
    }

    /// Forgets staged rows; the next write reopens and truncates the file.
    fn rollback(&mut self) {
        self.writer = None;
        self.next_id = self.committed_id;
        self.staged_len = 0;
    }
}

async fn count_lines(path: &Path) -> Result<u64, PersistenceError> {
    let file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut lines = BufReader::new(file).lines();
    let mut n = 0;
    while let Some(l) = lines.next_line().await? {
        if !l.trim().is_empty() {
            n += 1;
        }
    }
    Ok(n)
}

/// JSONL files `trades.jsonl` and `equity.jsonl` inside one directory.
pub struct JsonlSink {
    trades: Relation,
    equity: Relation,
}

impl JsonlSink {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref();
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).await?;
        }
        let trades = Relation::open(dir.join("trades.jsonl")).await?;
        let equity = Relation::open(dir.join("equity.jsonl")).await?;
        info!(dir = %dir.display(), next_trade_id = trades.next_id, next_equity_id = equity.next_id, "recorder: opened");
        Ok(Self { trades, equity })
    }
}

impl JsonlSink {
    fn rollback(&mut self) {
        self.trades.rollback();
        self.equity.rollback();
    }
}

#[async_trait]
impl PersistenceSink for JsonlSink {
    async fn append(&mut self, record: &Record) -> Result<(), PersistenceError> {
        let result = match record {
            Record::Trade(t) => self.trades.write_line(t).await,
            Record::Equity(e) => self.equity.write_line(e).await,
        };
        if result.is_err() {
            self.rollback();
        }
        result
    }

    async fn flush(&mut self) -> Result<(), PersistenceError> {
        // kedua file harus sukses flush sebelum ada yang di-commit
        let result = match self.trades.flush().await {
            Ok(()) => self.equity.flush().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.trades.commit();
                self.equity.commit();
                Ok(())
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }
}

/// Keeps records that have not been written yet, in arrival order.
pub struct Recorder<S: PersistenceSink> {
    sink: S,
    pending: VecDeque<Record>,
}

impl<S: PersistenceSink> Recorder<S> {
    pub fn new(sink: S) -> Self { Self { sink, pending: VecDeque::new() } }

    pub fn pending(&self) -> usize { self.pending.len() }

    pub fn sink(&self) -> &S { &self.sink }

    pub fn enqueue(&mut self, batch: impl IntoIterator<Item = Record>) {
        self.pending.extend(batch);
    }

    /// Writes pending records in order and commits them. Records leave the
    /// queue only after a successful flush; on failure the whole queue stays.
    pub async fn drain(&mut self) -> Result<usize, PersistenceError> {
        if self.pending.is_empty() {
            PERSIST_PENDING.set(0);
            return Ok(0);
        }
        let mut staged = 0;
        let mut result = Ok(());
        for rec in self.pending.iter() {
            if let Err(e) = self.sink.append(rec).await {
                result = Err(e);
                break;
            }
            staged += 1;
        }
        if result.is_ok() {
            result = self.sink.flush().await;
        }
        if let Err(e) = result {
            PERSIST_FAILURES.inc();
            PERSIST_PENDING.set(self.pending.len() as i64);
            return Err(e);
        }
        self.pending.drain(..staged);
        PERSIST_PENDING.set(0);
        Ok(staged)
    }

    async fn drain_logged(&mut self) {
        if let Err(e) = self.drain().await {
            warn!(error = %e, pending = self.pending.len(), "recorder: write failed, will retry");
        }
    }
}

/// Recorder task. Runs until every sender is dropped, then keeps retrying
/// whatever is still pending for a bounded number of attempts.
pub async fn run<S: PersistenceSink>(mut rx: mpsc::UnboundedReceiver<Vec<Record>>, sink: S, retry_every: Duration) {
    info!("recorder: started");
    let mut rec = Recorder::new(sink);

    let mut tick = interval(retry_every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_batch = rx.recv() => {
                match maybe_batch {
                    Some(batch) => {
                        rec.enqueue(batch);
                        rec.drain_logged().await;
                    }
                    None => break,
                }
            }
            _ = tick.tick() => {
                if rec.pending() > 0 {
                    rec.drain_logged().await;
                }
            }
        }
    }

    // Channel closed: last attempts before the process exits
    const FINAL_ATTEMPTS: u32 = 5;
    for attempt in 1..=FINAL_ATTEMPTS {
        match rec.drain().await {
            Ok(_) => break,
            Err(e) if attempt == FINAL_ATTEMPTS => {
                error!(error = %e, lost = rec.pending(), "recorder: giving up at shutdown");
            }
            Err(e) => {
                warn!(error = %e, attempt, "recorder: final drain failed, retrying");
                tokio::time::sleep(retry_every).await;
            }
        }
    }
    info!("recorder: channel closed, stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EquitySnapshot, Side, Trade};

    fn trade(i: u32) -> Record {
        Record::Trade(Trade {
            time: i as f64,
            bot_name: "b".into(),
            symbol: "X".into(),
            side: Side::Buy,
            size: 1.0,
            price: 10.0,
            cash_after: 90.0,
            position_after: 1.0,
        })
    }

    fn equity(i: u32) -> Record {
        Record::Equity(EquitySnapshot {
            time: i as f64,
            bot_name: "b".into(),
            equity: 100.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
        })
    }

    /// Stages on append, commits on flush. The first `fail_first` appends and
    /// the first `fail_flush_first` flushes fail and drop whatever was staged.
    #[derive(Default)]
    struct FlakySink {
        fail_first: u32,
        fail_flush_first: u32,
        calls: u32,
        flushes: u32,
        staged: Vec<Record>,
        written: Vec<Record>,
    }

    fn disk_full() -> PersistenceError {
        std::io::Error::new(std::io::ErrorKind::Other, "disk full").into()
    }

    #[async_trait]
    impl PersistenceSink for FlakySink {
        async fn append(&mut self, record: &Record) -> Result<(), PersistenceError> {
            self.calls += 1;
            if self.calls <= self.fail_first {
                self.staged.clear();
                return Err(disk_full());
            }
            self.staged.push(record.clone());
            Ok(())
        }
        async fn flush(&mut self) -> Result<(), PersistenceError> {
            self.flushes += 1;
            if self.flushes <= self.fail_flush_first {
                self.staged.clear();
                return Err(disk_full());
            }
            self.written.append(&mut self.staged);
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_writes_are_retried_in_order() {
        let mut rec = Recorder::new(FlakySink { fail_first: 2, ..Default::default() });
        rec.enqueue(vec![trade(1), equity(1)]);
        assert!(rec.drain().await.is_err());
        assert_eq!(rec.pending(), 2);

        rec.enqueue(vec![trade(2)]);
        assert!(rec.drain().await.is_err());
        assert_eq!(rec.pending(), 3);

        assert_eq!(rec.drain().await.unwrap(), 3);
        assert_eq!(rec.pending(), 0);
        assert_eq!(rec.sink().written, vec![trade(1), equity(1), trade(2)]);
    }

    #[tokio::test]
    async fn flush_failure_keeps_records_pending() {
        let failures = PERSIST_FAILURES.get();
        let mut rec = Recorder::new(FlakySink { fail_flush_first: 1, ..Default::default() });
        rec.enqueue(vec![trade(1), equity(1)]);

        assert!(rec.drain().await.is_err());
        assert_eq!(rec.pending(), 2);
        assert!(rec.sink().written.is_empty());
        assert!(PERSIST_FAILURES.get() >= failures + 1);

        rec.enqueue(vec![trade(2)]);
        assert_eq!(rec.drain().await.unwrap(), 3);
        assert_eq!(rec.pending(), 0);
        assert_eq!(rec.sink().written, vec![trade(1), equity(1), trade(2)]);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn full_disk_keeps_jsonl_records_pending() {
        // /dev/full tidak bisa dihitung barisnya (nol tanpa akhir), jadi dirakit langsung
        let full = || Relation {
            path: PathBuf::from("/dev/full"),
            writer: None,
            next_id: 1,
            committed_id: 1,
            committed_len: 0,
            staged_len: 0,
        };
        let sink = JsonlSink { trades: full(), equity: full() };
        let mut rec = Recorder::new(sink);
        rec.enqueue(vec![trade(1)]);

        assert!(rec.drain().await.is_err());
        assert_eq!(rec.pending(), 1);
        assert_eq!(rec.sink().trades.next_id, 1);

        assert!(rec.drain().await.is_err());
        assert_eq!(rec.pending(), 1);
    }

    #[tokio::test]
    async fn rollback_truncates_uncommitted_rows_and_reuses_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.jsonl");
        let mut rel = Relation::open(path.clone()).await.unwrap();

        #[derive(Serialize)]
        struct Note { text: &'static str }

        // baris sampai ke disk tapi tidak pernah di-commit
        rel.write_line(&Note { text: "half" }).await.unwrap();
        rel.writer.as_mut().unwrap().flush().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
        rel.rollback();

        rel.write_line(&Note { text: "whole" }).await.unwrap();
        rel.flush().await.unwrap();
        rel.commit();

        let body = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<&str> = body.lines().collect();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].contains("\"id\":1"));
        assert!(rows[0].contains("whole"));
        assert_eq!(rel.next_id, 2);
    }

    #[tokio::test]
    async fn jsonl_sink_writes_rows_and_continues_ids() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut sink = JsonlSink::open(dir.path()).await.unwrap();
            sink.append(&trade(1)).await.unwrap();
            sink.append(&trade(2)).await.unwrap();
            sink.append(&equity(1)).await.unwrap();
            sink.flush().await.unwrap();
        }
        {
            let mut sink = JsonlSink::open(dir.path()).await.unwrap();
            sink.append(&trade(3)).await.unwrap();
            sink.flush().await.unwrap();
        }

        let trades = std::fs::read_to_string(dir.path().join("trades.jsonl")).unwrap();
        let rows: Vec<serde_json::Value> =
            trades.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2]["id"], 3);
        assert_eq!(rows[2]["time"], 3.0);
        assert_eq!(rows[0]["side"], "BUY");
        assert_eq!(rows[0]["bot_name"], "b");
        assert!(rows[0].get("position_after").is_some());

        let eq = std::fs::read_to_string(dir.path().join("equity.jsonl")).unwrap();
        let row: serde_json::Value = serde_json::from_str(eq.lines().next().unwrap()).unwrap();
        assert_eq!(row["id"], 1);
        assert_eq!(row["equity"], 100.0);
    }

    #[tokio::test]
    async fn run_task_flushes_everything_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::open(dir.path()).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, sink, Duration::from_millis(10)));
        tx.send(vec![trade(1), equity(1)]).unwrap();
        tx.send(vec![equity(2)]).unwrap();
        drop(tx);
        task.await.unwrap();

        let eq = std::fs::read_to_string(dir.path().join("equity.jsonl")).unwrap();
        assert_eq!(eq.lines().count(), 2);
        let tr = std::fs::read_to_string(dir.path().join("trades.jsonl")).unwrap();
        assert_eq!(tr.lines().count(), 1);
    }
}
