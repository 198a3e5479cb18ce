//! Watch Loop
//!
//! Polls for newly added unfiled records and files them in a
//! stop / apply / restart cycle around the owning application.

use chrono::{DateTime, Local, NaiveDateTime};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::backup::BackupManager;
use crate::catalog::Catalog;
use crate::engine::{Policy, StructureEngine};
use crate::error::{ClerkError, Result};
use crate::models::{format_timestamp, parse_timestamp, CollectionTree, Record, RecordKey};
use crate::owner::{stop_owner, OwnerProcess};
use crate::provider::DecisionProvider;
use crate::suggestions::{write_atomic, SuggestionStore, WATCH_SUGGESTIONS_FILE};

const SLEEP_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Polling,
    Detecting,
    StoppingOwner,
    Generating,
    Applying,
    RestartingOwner,
    Stopped,
}

impl fmt::Display for WatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WatchState::Idle => "idle",
            WatchState::Polling => "polling",
            WatchState::Detecting => "detecting",
            WatchState::StoppingOwner => "stopping owner",
            WatchState::Generating => "generating",
            WatchState::Applying => "applying",
            WatchState::RestartingOwner => "restarting owner",
            WatchState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// The persisted watermark: one `YYYY-MM-DD HH:MM:SS` line.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn load(&self) -> Result<Option<NaiveDateTime>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        parse_timestamp(text).map(Some).ok_or_else(|| {
            ClerkError::Config(format!(
                "watermark file {} holds {:?}, expected YYYY-MM-DD HH:MM:SS",
                self.path.display(),
                text
            ))
        })
    }

    pub fn save(&self, ts: &NaiveDateTime) -> Result<()> {
        write_atomic(&self.path, &format!("{}\n", format_timestamp(ts)))
    }
}

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub poll_interval: Duration,
    pub stop_timeout: Duration,
    /// Consecutive polls without a database before giving up.
    pub max_missing_polls: u32,
    pub backup_dir: PathBuf,
    pub output_dir: PathBuf,
    pub watermark_path: PathBuf,
    pub policy: Policy,
}

#[derive(Debug, Clone, Default)]
pub struct WatchStats {
    pub cycles: u64,
    pub records_categorized: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_run: Option<DateTime<Local>>,
}

impl WatchStats {
    fn record_error(&mut self, error: &ClerkError) {
        self.failures += 1;
        self.last_error = Some(error.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    DatabaseMissing,
    NoNewRecords,
    Cancelled,
    /// The provider had nothing for the new records; watermark untouched.
    NothingProposed { detected: usize },
    Applied {
        detected: usize,
        applied: usize,
        rejected: usize,
        watermark: NaiveDateTime,
        /// Detected records without a placement that now sit behind the
        /// watermark and will not be offered again.
        skipped: Vec<RecordKey>,
    },
}

pub struct WatchLoop<P, O> {
    catalog: Catalog,
    provider: P,
    owner: O,
    settings: WatchSettings,
    engine: StructureEngine,
    backups: BackupManager,
    store: SuggestionStore,
    watermarks: WatermarkStore,
    stop: Arc<AtomicBool>,
    state: WatchState,
    watermark: Option<NaiveDateTime>,
    initialized: bool,
    missing_polls: u32,
    restart_pending: bool,
    /// Records the provider last declined, not offered again until the set changes
    declined: Option<HashSet<RecordKey>>,
    stats: WatchStats,
}

impl<P: DecisionProvider, O: OwnerProcess> WatchLoop<P, O> {
    pub fn new(catalog: Catalog, provider: P, owner: O, settings: WatchSettings) -> Self {
        Self {
            engine: StructureEngine::new(settings.policy),
            backups: BackupManager::new(&settings.backup_dir),
            store: SuggestionStore::new(&settings.output_dir),
            watermarks: WatermarkStore::new(&settings.watermark_path),
            catalog,
            provider,
            owner,
            settings,
            stop: Arc::new(AtomicBool::new(false)),
            state: WatchState::Idle,
            watermark: None,
            initialized: false,
            missing_polls: 0,
            restart_pending: false,
            declined: None,
            stats: WatchStats::default(),
        }
    }

    /// Setting this flag stops the loop at the next state boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn watermark(&self) -> Option<NaiveDateTime> {
        self.watermark
    }

    pub fn stats(&self) -> &WatchStats {
        &self.stats
    }

    pub fn owner(&self) -> &O {
        &self.owner
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    fn cancelled(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn set_state(&mut self, state: WatchState) {
        if self.state != state {
            debug!("Watch state: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    /// Poll until stopped. Only fatal errors end the loop early.
    pub fn run(&mut self) -> Result<WatchStats> {
        info!(
            "Watching {} every {:?}",
            self.catalog.path().display(),
            self.settings.poll_interval
        );

        while !self.cancelled() {
            self.set_state(WatchState::Polling);
            if !self.sleep(self.settings.poll_interval) {
                break;
            }
            if let Err(e) = self.step() {
                self.set_state(WatchState::Stopped);
                return Err(e);
            }
        }

        self.set_state(WatchState::Stopped);
        info!(
            "Watch stopped after {} cycle(s), {} record(s) filed",
            self.stats.cycles, self.stats.records_categorized
        );
        Ok(self.stats.clone())
    }

    /// One cycle without the initial sleep.
    pub fn run_once(&mut self) -> Result<CycleOutcome> {
        self.set_state(WatchState::Polling);
        let outcome = self.run_cycle();
        if let Err(e) = &outcome {
            self.stats.record_error(e);
        }
        self.set_state(if self.cancelled() {
            WatchState::Stopped
        } else {
            WatchState::Idle
        });
        outcome
    }

    fn step(&mut self) -> Result<()> {
        match self.run_cycle() {
            Ok(outcome) => {
                debug!("Cycle finished: {:?}", outcome);
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!("Giving up: {}", e);
                self.stats.record_error(&e);
                Err(e)
            }
            Err(e) => {
                warn!("Cycle failed, will retry on the next poll: {}", e);
                self.stats.record_error(&e);
                self.set_state(WatchState::Idle);
                Ok(())
            }
        }
    }

    fn sleep(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.cancelled() {
                return false;
            }
            let slice = remaining.min(SLEEP_SLICE);
            thread::sleep(slice);
            remaining -= slice;
        }
        !self.cancelled()
    }

    pub fn run_cycle(&mut self) -> Result<CycleOutcome> {
        self.stats.cycles += 1;
        self.stats.last_run = Some(Local::now());

        if self.restart_pending {
            self.restart_owner();
        }

        let conn = match self.catalog.open_read_only() {
            Ok(conn) => {
                self.missing_polls = 0;
                conn
            }
            Err(ClerkError::DatabaseNotFound(paths)) => {
                self.missing_polls += 1;
                warn!(
                    "Database missing ({}/{})",
                    self.missing_polls, self.settings.max_missing_polls
                );
                if self.missing_polls >= self.settings.max_missing_polls {
                    return Err(ClerkError::DatabaseNotFound(paths));
                }
                return Ok(CycleOutcome::DatabaseMissing);
            }
            Err(e) => return Err(e),
        };

        if !self.initialized {
            self.watermark = match self.watermarks.load()? {
                Some(ts) => Some(ts),
                None => {
                    // backlog stays with the manual categorize flow
                    let start = conn.max_unfiled_timestamp()?;
                    if let Some(ts) = &start {
                        self.watermarks.save(ts)?;
                    }
                    start
                }
            };
            self.initialized = true;
            info!(
                "Watermark: {}",
                self.watermark
                    .as_ref()
                    .map(format_timestamp)
                    .unwrap_or_else(|| "none".to_string())
            );
        }

        let records = match &self.watermark {
            Some(ts) => conn.list_unfiled_since(ts)?,
            None => conn.list_unfiled()?,
        };
        let hierarchy = conn.collections()?;
        drop(conn);

        self.set_state(WatchState::Detecting);
        if records.is_empty() {
            debug!("No new records");
            return Ok(CycleOutcome::NoNewRecords);
        }
        let keys: HashSet<RecordKey> = records.iter().map(|r| r.key.clone()).collect();
        if self.declined.as_ref() == Some(&keys) {
            debug!("Same {} record(s) as the last declined cycle", records.len());
            return Ok(CycleOutcome::NothingProposed {
                detected: records.len(),
            });
        }
        info!("Detected {} new record(s)", records.len());

        if self.cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }

        let result = self.process(&records, &hierarchy);
        self.restart_owner();
        self.set_state(WatchState::Idle);

        let outcome = result?;
        match &outcome {
            CycleOutcome::NothingProposed { .. } => {
                let mut pending: Vec<&RecordKey> = keys.iter().collect();
                pending.sort();
                warn!(
                    "Provider declined {}; not asking again until new records arrive",
                    join_keys(pending)
                );
                self.declined = Some(keys);
            }
            CycleOutcome::Applied { applied, .. } => {
                self.stats.records_categorized += *applied as u64;
                self.declined = None;
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Stopping-Owner through Applying. The caller restarts the owner
    /// whatever this returns.
    fn process(&mut self, records: &[Record], hierarchy: &CollectionTree) -> Result<CycleOutcome> {
        self.set_state(WatchState::StoppingOwner);
        let stopped = stop_owner(&self.owner, self.settings.stop_timeout)?;
        debug!("Owner stop: {:?}", stopped);
        self.catalog.reconcile_wal()?;

        if self.cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }

        self.set_state(WatchState::Generating);
        let audit = self.store.file(WATCH_SUGGESTIONS_FILE);
        self.store.discard(&audit)?;

        let mut proposal = self.provider.propose(records, hierarchy)?;
        let requested: HashSet<RecordKey> = records.iter().map(|r| r.key.clone()).collect();
        let dropped = proposal.retain_records(&requested);
        if dropped > 0 {
            warn!("Ignored {} placement(s) for records outside this cycle", dropped);
        }

        let newest = records
            .iter()
            .filter(|r| proposal.contains(&r.key))
            .map(|r| r.date_added)
            .max();
        let Some(newest) = newest else {
            info!("Nothing proposed for {} record(s)", records.len());
            return Ok(CycleOutcome::NothingProposed {
                detected: records.len(),
            });
        };
        self.store.save_proposal(WATCH_SUGGESTIONS_FILE, &proposal)?;

        if self.cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }

        self.set_state(WatchState::Applying);
        let report = self
            .engine
            .apply_session(&self.catalog, &self.backups, &proposal)?;

        // never moves backwards
        let watermark = self.watermark.map_or(newest, |current| current.max(newest));
        self.watermark = Some(watermark);
        self.watermarks.save(&watermark)?;

        if let Err(e) = self.store.archive(&audit) {
            warn!("Could not archive {}: {}", audit.display(), e);
        }

        let skipped: Vec<RecordKey> = records
            .iter()
            .filter(|r| !proposal.contains(&r.key) && r.date_added <= watermark)
            .map(|r| r.key.clone())
            .collect();
        if !skipped.is_empty() {
            warn!(
                "No placement for {}; left unfiled behind the watermark",
                join_keys(skipped.iter())
            );
        }

        let rejected = report.rejected().count();
        info!(
            "Filed {} record(s), {} rejected; watermark now {}",
            report.applied(),
            rejected,
            format_timestamp(&watermark)
        );
        Ok(CycleOutcome::Applied {
            detected: records.len(),
            applied: report.applied(),
            rejected,
            watermark,
            skipped,
        })
    }

    fn restart_owner(&mut self) {
        self.set_state(WatchState::RestartingOwner);
        match self.owner.start() {
            Ok(()) => self.restart_pending = false,
            Err(e) => {
                error!("Could not restart the owning application: {}", e);
                self.stats.record_error(&e);
                self.restart_pending = true;
            }
        }
    }
}

fn join_keys<'a>(keys: impl IntoIterator<Item = &'a RecordKey>) -> String {
    keys.into_iter()
        .map(RecordKey::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
