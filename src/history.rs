//! ==============================================================================
//! history.rs - per-device frequency history
//! ==============================================================================
//!
//! purpose:
//!     keeps a small run-length collapsed log of each board's operating
//!     frequency, one `<YYYYMMDDHHMMSS>:<frequency>` line per change. the log
//!     drives the history graph drawn by the rendering side, so it also
//!     decides when a device's graph is due for a redraw.
//!
//! invariants:
//!     - timestamps never decrease (late samples are clamped forward)
//!     - no two consecutive samples carry the same frequency
//!     - after `cut`, nothing is older than the window boundary and the first
//!       sample carries the frequency in effect at that boundary
//!
//! relationships:
//!     - used by: device.rs (append on frequency changes), engine.rs (cut, redraw)
//!     - stores: <data_dir>/history/<device id>.log
//!
//! ==============================================================================

use crate::config::HistoryConfig;
use crate::device::Device;
use crate::error::Result;
use crate::timestamp::Stamp;
use crate::DeviceId;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub at: Stamp,
    pub frequency: u32,
}

impl Sample {
    pub fn new(at: Stamp, frequency: u32) -> Self {
        Self { at, frequency }
    }

    fn to_line(self) -> String {
        format!("{}:{}", self.at, self.frequency)
    }

    fn parse_line(line: &str) -> Option<Self> {
        let (at, frequency) = line.trim().split_once(':')?;
        Some(Self { at: Stamp::parse(at)?, frequency: frequency.trim().parse().ok()? })
    }
}

// ==============================================================================
// pure log operations
// ==============================================================================

/// Append with run collapsing and timestamp clamping.
/// Returns whether a sample was actually added.
pub fn push_collapsed(samples: &mut Vec<Sample>, at: Stamp, frequency: u32) -> bool {
    match samples.last() {
        Some(last) if last.frequency == frequency => false,
        Some(last) => {
            let at = at.max(last.at);
            samples.push(Sample::new(at, frequency));
            true
        }
        None => {
            samples.push(Sample::new(at, frequency));
            true
        }
    }
}

/// Drop everything before `boundary`, carrying the frequency in effect there.
pub fn cut_samples(samples: Vec<Sample>, boundary: Stamp) -> Vec<Sample> {
    let split = samples.iter().position(|s| s.at >= boundary).unwrap_or(samples.len());
    if split == 0 {
        return samples;
    }
    let carried = samples[split - 1].frequency;
    let mut kept = samples[split..].iter().copied().peekable();
    let mut out = Vec::with_capacity(samples.len() - split + 1);
    if kept.peek().map(|s| s.at) != Some(boundary) {
        out.push(Sample::new(boundary, carried));
    }
    for sample in kept {
        push_collapsed(&mut out, sample.at, sample.frequency);
    }
    out
}

/// Whether a device's history graph is due for a redraw.
pub fn needs_redraw(device: &Device, now: Stamp, history: &HistoryConfig, retire_after: Duration) -> bool {
    if device.liveness.is_alive() {
        device.last_drawn.older_than(now, history.redraw())
    } else {
        !device.last_seen.older_than(now, retire_after)
            && device.last_drawn.older_than(now, history.dead_redraw())
    }
}

// ==============================================================================
// on-disk log
// ==============================================================================

#[derive(Debug, Clone)]
pub struct HistoryLog {
    dir: PathBuf,
}

impl HistoryLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, id: DeviceId) -> PathBuf {
        self.dir.join(format!("{}.log", id))
    }

    pub fn exists(&self, id: DeviceId) -> bool {
        self.path(id).exists()
    }

    /// All samples, skipping lines that do not parse.
    pub fn read(&self, id: DeviceId) -> Vec<Sample> {
        let text = match fs::read_to_string(self.path(id)) {
            Ok(text) => text,
            Err(_) => return Vec::new(),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| {
                let sample = Sample::parse_line(line);
                if sample.is_none() {
                    tracing::warn!("device {}: skipping bad history line {:?}", id, line);
                }
                sample
            })
            .collect()
    }

    /// Append one sample unless it repeats the current frequency.
    pub fn append(&self, id: DeviceId, at: Stamp, frequency: u32) -> Result<bool> {
        let mut samples = self.read(id);
        if !push_collapsed(&mut samples, at, frequency) {
            return Ok(false);
        }
        let Some(sample) = samples.last().copied() else {
            return Ok(false);
        };
        fs::create_dir_all(&self.dir)?;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(self.path(id))?;
        writeln!(file, "{}", sample.to_line())?;
        tracing::debug!("device {}: history {}", id, sample.to_line());
        Ok(true)
    }

    /// Trim the log to `max_span` before `now`.
    ///
    /// `seed` is `(boot time, current frequency)` for a live device; it starts
    /// a log that does not exist yet.
    pub fn cut(&self, id: DeviceId, now: Stamp, max_span: Duration, seed: Option<(Stamp, u32)>) -> Result<()> {
        let boundary = now.minus(max_span);
        let samples = self.read(id);
        let trimmed = if samples.is_empty() {
            match seed {
                Some((boot, frequency)) => {
                    let start = if boot.is_never() { boundary } else { boot.max(boundary) };
                    vec![Sample::new(start, frequency)]
                }
                None => return Ok(()),
            }
        } else {
            let before = samples.len();
            let trimmed = cut_samples(samples.clone(), boundary);
            if trimmed == samples {
                return Ok(());
            }
            tracing::debug!("device {}: history cut from {} to {} samples", id, before, trimmed.len());
            trimmed
        };
        self.write_all(id, &trimmed)
    }

    pub fn remove(&self, id: DeviceId) -> Result<()> {
        match fs::remove_file(self.path(id)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn write_all(&self, id: DeviceId, samples: &[Sample]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(id);
        let tmp = path.with_extension("log.tmp");
        let mut body = String::new();
        for sample in samples {
            body.push_str(&sample.to_line());
            body.push('\n');
        }
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
