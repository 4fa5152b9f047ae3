//! Ordered JSONL output for predictions
//!
//! Workers finish out of order; the writer buffers results until the next
//! sequence number arrives so the file always follows dataset order. Every
//! line is flushed as soon as it is written, so an interrupted run leaves a
//! valid prefix behind.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dataset::PredictionRecord;

/// Reorders `(sequence, prediction)` pairs into a line-delimited stream
pub struct PredictionWriter<W: Write> {
    out: W,
    next_seq: usize,
    pending: BTreeMap<usize, PredictionRecord>,
    written: usize,
}

impl<W: Write> PredictionWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            next_seq: 0,
            pending: BTreeMap::new(),
            written: 0,
        }
    }

    /// Accept one result and write every line that is now in order
    pub fn push(&mut self, seq: usize, prediction: PredictionRecord) -> io::Result<()> {
        self.pending.insert(seq, prediction);
        while let Some(prediction) = self.pending.remove(&self.next_seq) {
            self.write_line(&prediction)?;
            self.next_seq += 1;
        }
        Ok(())
    }

    /// Write whatever is still buffered and return the number of lines written
    ///
    /// Anything left here sits behind a sequence number that never arrived.
    pub fn finish(mut self) -> io::Result<usize> {
        if !self.pending.is_empty() {
            tracing::warn!(
                "{} predictions written after a gap at position {}",
                self.pending.len(),
                self.next_seq
            );
        }
        for prediction in std::mem::take(&mut self.pending).into_values() {
            self.write_line(&prediction)?;
        }
        self.out.flush()?;
        Ok(self.written)
    }

    fn write_line(&mut self, prediction: &PredictionRecord) -> io::Result<()> {
        let mut line = serde_json::to_string(prediction)?;
        line.push('\n');
        self.out.write_all(line.as_bytes())?;
        self.out.flush()?;
        self.written += 1;
        Ok(())
    }
}

/// Run a writer on the blocking pool until every sender is dropped
pub fn spawn_writer(
    file: File,
    mut rx: mpsc::Receiver<(usize, PredictionRecord)>,
) -> JoinHandle<io::Result<usize>> {
    tokio::task::spawn_blocking(move || {
        let mut writer = PredictionWriter::new(BufWriter::new(file));
        while let Some((seq, prediction)) = rx.blocking_recv() {
            writer.push(seq, prediction)?;
        }
        writer.finish()
    })
}

/// Replace `path` with `predictions` through a temporary file and a rename
pub fn write_predictions_atomic(path: &Path, predictions: &[PredictionRecord]) -> io::Result<()> {
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut out = BufWriter::new(File::create(&tmp)?);
        for prediction in predictions {
            serde_json::to_writer(&mut out, prediction)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
    }
    fs::rename(&tmp, path)
}
