//! Line sources feeding the trainers.
//!
//! Three variants share one contract: `next(shard)` hands out the next
//! parsed sample of a shard, or `None` once the shard is drained. Every
//! non-empty line of the input is delivered to exactly one shard over the
//! life of a reader.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use snafu::ResultExt;

use crate::error::{IoSnafu, Result};
use crate::sample::{Feature, parse_sample};

/// One byte-range shard of a split file. The shard owns an independent
/// file handle positioned at the start of its first whole line.
struct FileShard {
    reader: BufReader<File>,
    /// Absolute byte offset of the next unread byte.
    pos: u64,
    /// Lines starting at or past this offset belong to the next shard.
    end: u64,
}

impl FileShard {
    /// A line belongs to the shard whose byte range contains its first
    /// byte; a shard keeps reading past `end` until that line is complete.
    fn open(path: &Path, start: u64, end: u64, file_len: u64) -> Result<Self> {
        let mut file = File::open(path).context(IoSnafu { path })?;
        let mut pos = start;
        if start > 0 {
            // Realign to a line boundary: unless the previous byte is a
            // newline, the cursor sits inside a line owned by the shard
            // before this one.
            file.seek(SeekFrom::Start(start - 1))
                .context(IoSnafu { path })?;
            let mut prev = [0u8; 1];
            file.read_exact(&mut prev).context(IoSnafu { path })?;
            let mut reader = BufReader::new(file);
            if prev[0] != b'\n' {
                let mut skipped = Vec::new();
                let n = reader
                    .read_until(b'\n', &mut skipped)
                    .context(IoSnafu { path })?;
                pos += n as u64;
            }
            return Ok(Self { reader, pos, end: end.min(file_len) });
        }
        let reader = BufReader::new(file);
        Ok(Self { reader, pos, end: end.min(file_len) })
    }

    fn next_line(&mut self, path: &Path) -> Result<Option<String>> {
        if self.pos >= self.end {
            return Ok(None);
        }
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).context(IoSnafu { path })?;
        if n == 0 {
            return Ok(None);
        }
        self.pos += n as u64;
        Ok(Some(line))
    }
}

/// Cursor over a contiguous index range of the in-memory line list.
struct MemoryCursor {
    next: usize,
    end: usize,
}

/// A sharded sample source. The variants are deliberately a closed set
/// behind one `next(shard)` operation rather than a trait object.
pub struct DatasetReader {
    kind: ReaderKind,
}

enum ReaderKind {
    /// The input file cut into N approximately equal byte ranges, one
    /// independent buffered handle per shard. The per-shard mutex is
    /// uncontended: shard i is only ever pulled by worker i.
    SplitFile {
        path: std::path::PathBuf,
        shards: Vec<Mutex<FileShard>>,
    },
    /// One buffered reader all shards pull from round-robin.
    SharedFile {
        path: std::path::PathBuf,
        reader: Mutex<BufReader<File>>,
    },
    /// An owned line list cut into N equal index ranges.
    Memory {
        lines: Vec<String>,
        cursors: Vec<Mutex<MemoryCursor>>,
    },
}

impl DatasetReader {
    /// Split `path` into `shard_num` byte-aligned shards. Boundaries are
    /// realigned to whole lines so each line is delivered exactly once;
    /// the final shard runs to end of file.
    pub fn split_file(path: &Path, shard_num: usize) -> Result<Self> {
        let shard_num = shard_num.max(1);
        let len = fs::metadata(path).context(IoSnafu { path })?.len();
        let size = (len / shard_num as u64).max(1);

        let mut shards = Vec::with_capacity(shard_num);
        for i in 0..shard_num {
            let start = (i as u64 * size).min(len);
            let end = if i + 1 == shard_num {
                len
            } else {
                ((i as u64 + 1) * size).min(len)
            };
            shards.push(Mutex::new(FileShard::open(path, start, end, len)?));
        }
        Ok(Self {
            kind: ReaderKind::SplitFile {
                path: path.to_path_buf(),
                shards,
            },
        })
    }

    /// One mutex-guarded reader shared by every shard id.
    pub fn shared_file(path: &Path) -> Result<Self> {
        let file = File::open(path).context(IoSnafu { path })?;
        Ok(Self {
            kind: ReaderKind::SharedFile {
                path: path.to_path_buf(),
                reader: Mutex::new(BufReader::new(file)),
            },
        })
    }

    /// Cut an in-memory line list into `shard_num` equal index ranges.
    pub fn memory(lines: Vec<String>, shard_num: usize) -> Self {
        let shard_num = shard_num.max(1);
        let len = lines.len();
        let cursors = (0..shard_num)
            .map(|i| {
                Mutex::new(MemoryCursor {
                    next: i * len / shard_num,
                    end: (i + 1) * len / shard_num,
                })
            })
            .collect();
        Self {
            kind: ReaderKind::Memory { lines, cursors },
        }
    }

    pub fn shard_count(&self) -> usize {
        match &self.kind {
            ReaderKind::SplitFile { shards, .. } => shards.len(),
            ReaderKind::SharedFile { .. } => 1,
            ReaderKind::Memory { cursors, .. } => cursors.len(),
        }
    }

    /// Next parsed sample of a shard, or `None` once it is drained.
    ///
    /// Empty lines are skipped; a line whose label does not parse is
    /// warned and skipped so one bad record cannot end an epoch early.
    pub fn next(&self, shard: usize) -> Result<Option<(f64, Vec<Feature>)>> {
        loop {
            let line = match &self.kind {
                ReaderKind::SplitFile { path, shards } => {
                    shards[shard].lock().unwrap().next_line(path)?
                }
                ReaderKind::SharedFile { path, reader } => {
                    let mut reader = reader.lock().unwrap();
                    let mut line = String::new();
                    let n = reader.read_line(&mut line).context(IoSnafu { path })?;
                    if n == 0 { None } else { Some(line) }
                }
                ReaderKind::Memory { lines, cursors } => {
                    let mut cursor = cursors[shard].lock().unwrap();
                    if cursor.next >= cursor.end {
                        None
                    } else {
                        let line = lines[cursor.next].clone();
                        cursor.next += 1;
                        Some(line)
                    }
                }
            };

            let Some(line) = line else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_sample(&line) {
                Ok(sample) => return Ok(Some(sample)),
                Err(err) => {
                    warn!("skipping unparsable sample line: {err}");
                }
            }
        }
    }
}

/// Rewrite `path` in place keeping each line with probability `ratio`.
/// A negative ratio keeps every positive sample and keeps negatives with
/// probability `-ratio`. Zero and ratios outside `(-1, 1]` leave the file
/// alone. The original content is preserved at `<path>.bak`.
pub fn subsample_file(path: &Path, ratio: f64, seed: u64) -> Result<()> {
    if ratio <= -1.0 || ratio > 1.0 || ratio == 0.0 {
        return Ok(());
    }

    let backup = path.with_extension("bak");
    fs::copy(path, &backup).context(IoSnafu { path })?;

    let input = File::open(&backup).context(IoSnafu { path: &backup })?;
    let mut output = File::create(path).context(IoSnafu { path })?;
    let mut rng = StdRng::seed_from_u64(seed);

    for line in BufReader::new(input).lines() {
        let line = line.context(IoSnafu { path: &backup })?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let keep = if ratio > 0.0 {
            rng.r#gen::<f64>() < ratio
        } else {
            // keep positives, downsample negatives
            match line.split_whitespace().next().and_then(|t| t.parse::<f64>().ok()) {
                Some(label) if label > 0.0 => true,
                _ => rng.r#gen::<f64>() < -ratio,
            }
        };
        if keep {
            writeln!(output, "{line}").context(IoSnafu { path })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn write_lines(dir: &tempfile::TempDir, name: &str, n: usize) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        for i in 0..n {
            // one feature whose value encodes the line id
            writeln!(f, "{} 1:{}", i % 2, i).unwrap();
        }
        path
    }

    fn drain_ids(reader: &DatasetReader, shard: usize) -> Vec<usize> {
        let mut ids = Vec::new();
        while let Some((_, x)) = reader.next(shard).unwrap() {
            ids.push(x[1].value as usize);
        }
        ids
    }

    #[test]
    fn split_file_delivers_every_line_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lines(&dir, "train.dat", 103);
        let reader = DatasetReader::split_file(&path, 4).unwrap();

        let mut seen = Vec::new();
        for shard in 0..reader.shard_count() {
            seen.extend(drain_ids(&reader, shard));
        }
        assert_eq!(seen.len(), 103);
        assert_eq!(seen.iter().copied().collect::<HashSet<_>>().len(), 103);
    }

    #[test]
    fn split_file_with_more_shards_than_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lines(&dir, "tiny.dat", 2);
        let reader = DatasetReader::split_file(&path, 8).unwrap();
        let total: usize = (0..8).map(|s| drain_ids(&reader, s).len()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn shared_file_ignores_shard_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lines(&dir, "shared.dat", 10);
        let reader = DatasetReader::shared_file(&path).unwrap();
        let mut seen = Vec::new();
        for shard in [0usize, 3, 1, 2] {
            for _ in 0..3 {
                if let Some((_, x)) = reader.next(shard).unwrap() {
                    seen.push(x[1].value as usize);
                }
            }
        }
        assert_eq!(seen.len(), 10);
        assert_eq!(seen.iter().copied().collect::<HashSet<_>>().len(), 10);
    }

    #[test]
    fn memory_ranges_partition_the_lines() {
        let lines: Vec<String> = (0..10).map(|i| format!("1 1:{i}")).collect();
        let reader = DatasetReader::memory(lines, 3);
        let counts: Vec<usize> = (0..3).map(|s| drain_ids(&reader, s).len()).collect();
        assert_eq!(counts.iter().sum::<usize>(), 10);
        // 10/3 split: [0,3), [3,6), [6,10)
        assert_eq!(counts, vec![3, 3, 4]);
    }

    #[test]
    fn unparsable_lines_are_skipped() {
        let lines = vec![
            "1 1:0.5".to_string(),
            "garbage".to_string(),
            "0 2:1".to_string(),
        ];
        let reader = DatasetReader::memory(lines, 1);
        let mut n = 0;
        while reader.next(0).unwrap().is_some() {
            n += 1;
        }
        assert_eq!(n, 2);
    }

    #[test]
    fn subsample_keeps_positives_with_negative_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.dat");
        let mut f = File::create(&path).unwrap();
        for i in 0..50 {
            writeln!(f, "{} 1:{}", i % 2, i).unwrap();
        }
        drop(f);

        subsample_file(&path, -0.2, 7).unwrap();
        let kept = fs::read_to_string(&path).unwrap();
        let labels: Vec<&str> = kept
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.split_whitespace().next().unwrap())
            .collect();
        assert_eq!(labels.iter().filter(|&&l| l == "1").count(), 25);
        assert!(labels.iter().filter(|&&l| l == "0").count() < 25);
        assert!(path.with_extension("bak").exists());
    }
}
