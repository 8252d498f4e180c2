use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::SecondsFormat;

use crate::buffer::LogBuffer;
use crate::error::Result;

/// Write each pod's buffered lines to `<dir>/<pod>.log`.
///
/// Lines that arrived with a timestamp are written with it, in the same
/// RFC3339 form the cluster uses. Returns the files written, sorted by pod.
pub fn export_buffers(buffer: &LogBuffer, dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;

    let mut written = Vec::new();
    for (pod, lines) in buffer.snapshot_all() {
        let path = dir.join(format!("{}.log", pod));
        let mut out = BufWriter::new(File::create(&path)?);

        for line in &lines {
            match line.timestamp {
                Some(ts) => writeln!(
                    out,
                    "{} {}",
                    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                    line.message
                )?,
                None => writeln!(out, "{}", line.message)?,
            }
        }
        out.flush()?;

        tracing::debug!(pod = %pod, lines = lines.len(), path = %path.display(), "exported pod log");
        written.push(path);
    }

    Ok(written)
}
