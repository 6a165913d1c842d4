use anyhow::{anyhow, Result};
use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use super::csv_file::{CsvFile, Row};
use super::{LifecycleAware, OutputParameter, Parameterized, PathBacked, Phase, PhaseContext, Role};
use crate::error::HarnessError;

/// Column names of the CSV written by [`MachineMonitor`], in order.
pub const SAMPLE_KEYS: &[&str] = &[
    "time",
    "cpu_percentage",
    "mem_total",
    "mem_used",
    "mem_free",
    "cached",
    "buffers",
    "net_send",
    "net_recv",
    "disk_read",
    "disk_write",
];

const SECTOR_BYTES: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    Cpu,
    Memory,
    Net,
    Disk,
}

pub const ALL_CAPTURES: &[Capture] = &[Capture::Cpu, Capture::Memory, Capture::Net, Capture::Disk];

#[derive(Debug)]
struct Worker {
    running: Arc<AtomicBool>,
    samples: Arc<Mutex<Vec<Row>>>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn stop(self) -> Result<Vec<Row>> {
        self.running.store(false, Ordering::SeqCst);
        self.handle
            .join()
            .map_err(|_| anyhow!("machine monitor thread panicked"))?;
        let mut samples = self
            .samples
            .lock()
            .map_err(|_| anyhow!("machine monitor samples poisoned"))?;
        Ok(std::mem::take(&mut *samples))
    }
}

/// Samples system load on a background thread while the run executes and
/// stores one CSV row per tick. Missing sources are recorded as `-1`.
#[derive(Debug)]
pub struct MachineMonitor {
    csv: CsvFile,
    tick: Duration,
    capture: Vec<Capture>,
    worker: Option<Worker>,
}

impl MachineMonitor {
    pub fn new(filename: &str) -> Self {
        Self {
            csv: CsvFile::new(filename),
            tick: Duration::from_millis(100),
            capture: ALL_CAPTURES.to_vec(),
            worker: None,
        }
    }

    pub fn tick_interval(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn capture(mut self, capture: &[Capture]) -> Self {
        self.capture = capture.to_vec();
        self
    }

    pub fn is_sampling(&self) -> bool {
        self.worker.is_some()
    }

    fn start(&mut self) {
        let running = Arc::new(AtomicBool::new(true));
        let samples = Arc::new(Mutex::new(Vec::new()));
        let tick = self.tick;
        let mut sampler = Sampler::new(&self.capture);
        let handle = {
            let running = Arc::clone(&running);
            let samples = Arc::clone(&samples);
            thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    let row = sampler.sample();
                    if let Ok(mut rows) = samples.lock() {
                        rows.push(row);
                    }
                    thread::sleep(tick);
                }
            })
        };
        debug!(tick_ms = tick.as_millis() as u64, "machine monitor started");
        self.worker = Some(Worker {
            running,
            samples,
            handle,
        });
    }

    /// Waits one more tick so the last sample lands, then stops and joins
    /// the sampler before the rows are handed to the CSV buffer.
    fn finish(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        thread::sleep(self.tick);
        let rows = worker.stop()?;
        debug!(samples = rows.len(), "machine monitor stopped");
        let mut all = self.csv.rows()?;
        all.extend(rows);
        self.csv.set_rows(all);
        self.csv.flush()
    }

    /// Stops and joins the sampler, dropping its rows.
    fn discard(&mut self) {
        if let Some(worker) = self.worker.take() {
            match worker.stop() {
                Ok(rows) => debug!(discarded = rows.len(), "machine monitor aborted"),
                Err(e) => warn!(error = %e, "machine monitor thread did not stop cleanly"),
            }
        }
    }

    pub fn rows(&self) -> Result<Vec<Row>> {
        self.csv.rows()
    }

    /// Selected columns of every sample, by name from [`SAMPLE_KEYS`].
    pub fn extract(&self, keys: &[&str]) -> Result<Vec<Vec<f64>>> {
        let mut indices = Vec::with_capacity(keys.len());
        for key in keys {
            let index = SAMPLE_KEYS.iter().position(|k| k == key).ok_or_else(|| {
                HarnessError::invalid_value(self.csv.name(), format!("unknown sample key '{}'", key))
            })?;
            indices.push(index);
        }
        let mut out = Vec::new();
        for row in self.rows()? {
            let mut values = Vec::with_capacity(indices.len());
            for &index in &indices {
                let field = row.get(index).map(|s| s.as_str()).unwrap_or("-1");
                let value = field
                    .parse::<f64>()
                    .map_err(|_| anyhow!("sample field '{}' is not numeric", field))?;
                values.push(value);
            }
            out.push(values);
        }
        Ok(out)
    }
}

impl Drop for MachineMonitor {
    fn drop(&mut self) {
        self.discard();
    }
}

impl PathBacked for MachineMonitor {
    fn path(&self) -> Result<PathBuf> {
        self.csv.path()
    }
}

impl Parameterized for MachineMonitor {
    fn name(&self) -> &str {
        self.csv.name()
    }

    fn set_name(&mut self, name: &str) {
        self.csv.set_name(name);
    }
}

impl LifecycleAware for MachineMonitor {
    fn on_phase(&mut self, ctx: &mut PhaseContext<'_>, role: Role, phase: Phase) -> Result<()> {
        match (role, phase) {
            (Role::Output, Phase::Before) => {
                self.csv.prepare_output(ctx)?;
                self.start();
                Ok(())
            }
            (Role::Output, Phase::After) => self.finish(),
            _ => self.csv.on_phase(ctx, role, phase),
        }
    }

    fn abort(&mut self) {
        self.discard();
    }
}

impl OutputParameter for MachineMonitor {}

struct Sampler {
    capture: Vec<Capture>,
    cpu: Option<(u64, u64)>,
    net: Option<(u64, u64)>,
    disk: Option<(u64, u64)>,
}

impl Sampler {
    fn new(capture: &[Capture]) -> Self {
        Self {
            capture: capture.to_vec(),
            cpu: None,
            net: None,
            disk: None,
        }
    }

    fn sample(&mut self) -> Row {
        let mut row = vec![format!("{:.6}", Utc::now().timestamp_micros() as f64 / 1_000_000.0)];
        if self.capture.contains(&Capture::Cpu) {
            row.push(self.cpu_percentage().map(|p| format!("{:.2}", p)).unwrap_or_else(missing));
        } else {
            row.push(missing());
        }
        if self.capture.contains(&Capture::Memory) {
            match read_memory() {
                Some(values) => row.extend(values.iter().map(|v| v.to_string())),
                None => row.extend((0..5).map(|_| missing())),
            }
        } else {
            row.extend((0..5).map(|_| missing()));
        }
        if self.capture.contains(&Capture::Net) {
            push_delta(&mut row, &mut self.net, read_net());
        } else {
            row.extend((0..2).map(|_| missing()));
        }
        if self.capture.contains(&Capture::Disk) {
            push_delta(&mut row, &mut self.disk, read_disk());
        } else {
            row.extend((0..2).map(|_| missing()));
        }
        row
    }

    fn cpu_percentage(&mut self) -> Option<f64> {
        let (busy, total) = read_cpu()?;
        let (prev_busy, prev_total) = self.cpu.replace((busy, total)).unwrap_or((0, 0));
        let total_delta = total.saturating_sub(prev_total);
        if total_delta == 0 {
            return Some(0.0);
        }
        Some(busy.saturating_sub(prev_busy) as f64 * 100.0 / total_delta as f64)
    }
}

fn missing() -> String {
    "-1".to_string()
}

fn push_delta(row: &mut Row, previous: &mut Option<(u64, u64)>, current: Option<(u64, u64)>) {
    match current {
        Some((a, b)) => {
            let (prev_a, prev_b) = previous.replace((a, b)).unwrap_or((a, b));
            row.push(a.saturating_sub(prev_a).to_string());
            row.push(b.saturating_sub(prev_b).to_string());
        }
        None => row.extend((0..2).map(|_| missing())),
    }
}

/// `(busy, total)` jiffies from the aggregate line of `/proc/stat`.
fn read_cpu() -> Option<(u64, u64)> {
    let stat = fs::read_to_string("/proc/stat").ok()?;
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some((total.saturating_sub(idle), total))
}

/// Total, used, free, cached and buffers in bytes from `/proc/meminfo`.
fn read_memory() -> Option<[u64; 5]> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    let field = |key: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(key) && l[key.len()..].starts_with(':'))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    };
    let total = field("MemTotal")?;
    let free = field("MemFree")?;
    let available = field("MemAvailable").unwrap_or(free);
    Some([
        total,
        total.saturating_sub(available),
        free,
        field("Cached").unwrap_or(0),
        field("Buffers").unwrap_or(0),
    ])
}

/// Bytes `(sent, received)` summed over all interfaces except loopback.
fn read_net() -> Option<(u64, u64)> {
    let dev = fs::read_to_string("/proc/net/dev").ok()?;
    let mut sent = 0;
    let mut received = 0;
    for line in dev.lines().skip(2) {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<u64> = counters
            .split_whitespace()
            .filter_map(|f| f.parse().ok())
            .collect();
        if fields.len() >= 9 {
            received += fields[0];
            sent += fields[8];
        }
    }
    Some((sent, received))
}

/// Bytes `(read, written)` summed over all block devices.
fn read_disk() -> Option<(u64, u64)> {
    let stats = fs::read_to_string("/proc/diskstats").ok()?;
    let mut read = 0;
    let mut written = 0;
    for line in stats.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        read += fields[5].parse::<u64>().unwrap_or(0) * SECTOR_BYTES;
        written += fields[9].parse::<u64>().unwrap_or(0) * SECTOR_BYTES;
    }
    Some((read, written))
}
