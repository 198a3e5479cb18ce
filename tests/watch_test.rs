//! Watch cycles against a real library with a scripted owner and provider

mod common;

use common::{key, placement, ts, Library};
use research_clerk::models::CollectionTree;
use research_clerk::{
    Catalog, ClerkError, CycleOutcome, OwnerProcess, Policy, Proposal, Record, Result, WatchLoop,
    WatchSettings, WatchState,
};
use std::cell::{Cell, RefCell};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const T0: &str = "2024-01-10 00:00:00";
const T1: &str = "2024-01-15 09:30:00";

/// Owner that only records what it was asked to do.
struct FakeOwner {
    running: Cell<bool>,
    events: RefCell<Vec<&'static str>>,
    stop_on_start: Option<Arc<AtomicBool>>,
}

impl FakeOwner {
    fn new() -> Self {
        Self {
            running: Cell::new(true),
            events: RefCell::new(Vec::new()),
            stop_on_start: None,
        }
    }

    fn events(&self) -> Vec<&'static str> {
        self.events.borrow().clone()
    }
}

impl OwnerProcess for FakeOwner {
    fn is_running(&self) -> Result<bool> {
        Ok(self.running.get())
    }

    fn request_stop(&self) -> Result<()> {
        self.events.borrow_mut().push("stop");
        self.running.set(false);
        Ok(())
    }

    fn force_stop(&self) -> Result<()> {
        self.events.borrow_mut().push("kill");
        self.running.set(false);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.events.borrow_mut().push("start");
        self.running.set(true);
        if let Some(flag) = &self.stop_on_start {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn file_into_inbox(records: &[Record], _hierarchy: &CollectionTree) -> Result<Proposal> {
    let mut proposal = Proposal::new();
    for record in records {
        proposal.insert(record.key.clone(), placement("Inbox", &["new", "unsorted"]));
    }
    Ok(proposal)
}

fn offline(_records: &[Record], _hierarchy: &CollectionTree) -> Result<Proposal> {
    Err(ClerkError::Provider("provider offline".to_string()))
}

/// Only answers for a record that is not part of the cycle.
fn off_topic(_records: &[Record], _hierarchy: &CollectionTree) -> Result<Proposal> {
    let mut proposal = Proposal::new();
    proposal.insert(key("ELSEWHER"), placement("Inbox", &["new", "unsorted"]));
    Ok(proposal)
}

/// Answers only for the most recently added record.
fn newest_only(records: &[Record], _hierarchy: &CollectionTree) -> Result<Proposal> {
    let mut proposal = Proposal::new();
    if let Some(newest) = records.iter().max_by_key(|r| r.date_added) {
        proposal.insert(newest.key.clone(), placement("Inbox", &["new", "unsorted"]));
    }
    Ok(proposal)
}

fn settings(lib: &Library) -> WatchSettings {
    WatchSettings {
        poll_interval: Duration::from_millis(10),
        stop_timeout: Duration::from_secs(1),
        max_missing_polls: 2,
        backup_dir: lib.backup_dir(),
        output_dir: lib.dir.path().join("out"),
        watermark_path: lib.dir.path().join("state").join("watermark"),
        policy: Policy::default(),
    }
}

fn preset_watermark(lib: &Library, value: &str) {
    let path = settings(lib).watermark_path;
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, format!("{}\n", value)).unwrap();
}

fn watermark_file(lib: &Library) -> Option<String> {
    fs::read_to_string(settings(lib).watermark_path).ok()
}

/// One record from before the watermark and two newer ones.
fn library_with_new_records() -> Library {
    let lib = Library::new();
    lib.add_item("BACKLOG1", "Old unfiled paper", "2024-01-05 08:00:00");
    lib.add_item("NEWITEM1", "Fresh preprint", "2024-01-12 10:00:00");
    lib.add_item("NEWITEM2", "Fresher preprint", T1);
    preset_watermark(&lib, T0);
    lib
}

#[test]
fn test_cycle_files_new_records_and_advances_watermark() {
    let lib = library_with_new_records();
    let mut watch = WatchLoop::new(lib.catalog(), file_into_inbox, FakeOwner::new(), settings(&lib));

    let outcome = watch.run_once().expect("cycle failed");
    assert_eq!(
        outcome,
        CycleOutcome::Applied {
            detected: 2,
            applied: 2,
            rejected: 0,
            watermark: ts(T1),
            skipped: vec![],
        }
    );
    assert_eq!(watch.watermark(), Some(ts(T1)));
    assert_eq!(watermark_file(&lib).as_deref(), Some("2024-01-15 09:30:00\n"));
    assert_eq!(watch.owner().events(), vec!["stop", "start"]);
    assert_eq!(watch.state(), WatchState::Idle);
    assert_eq!(watch.stats().records_categorized, 2);

    let inbox = lib.collection_id("Inbox").expect("Inbox not created");
    assert_eq!(lib.members(inbox), vec!["NEWITEM1", "NEWITEM2"]);
    // the backlog is left for the manual flow
    let unfiled = lib.catalog().open_read_only().unwrap().list_unfiled().unwrap();
    assert_eq!(unfiled.len(), 1);
    assert_eq!(unfiled[0].key, key("BACKLOG1"));
    assert_eq!(lib.backup_files().len(), 1);

    // the audit copy was archived, not left behind
    let out = lib.dir.path().join("out");
    assert!(!out.join("watch-suggestions.json").exists());
    let archived: Vec<String> = fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(archived.len(), 1);
    assert!(archived[0].starts_with("watch-suggestions.applied-"));

    let again = watch.run_once().expect("second cycle failed");
    assert_eq!(again, CycleOutcome::NoNewRecords);
    assert_eq!(watch.owner().events(), vec!["stop", "start"]);
}

#[test]
fn test_provider_failure_keeps_watermark_and_restarts_owner() {
    let lib = library_with_new_records();
    let mut watch = WatchLoop::new(lib.catalog(), offline, FakeOwner::new(), settings(&lib));

    let err = watch.run_once().expect_err("cycle should fail");
    assert!(matches!(err, ClerkError::Provider(_)));
    assert!(!err.is_fatal());

    assert_eq!(watch.owner().events(), vec!["stop", "start"]);
    assert!(watch.owner().running.get());
    assert_eq!(watch.watermark(), Some(ts(T0)));
    assert_eq!(watermark_file(&lib).as_deref(), Some("2024-01-10 00:00:00\n"));
    assert_eq!(watch.stats().failures, 1);
    assert!(lib.backup_files().is_empty());
    assert_eq!(lib.collection_count(), 0);
}

#[test]
fn test_nothing_proposed_leaves_watermark() {
    let lib = library_with_new_records();
    let mut watch = WatchLoop::new(lib.catalog(), off_topic, FakeOwner::new(), settings(&lib));

    let outcome = watch.run_once().expect("cycle failed");
    assert_eq!(outcome, CycleOutcome::NothingProposed { detected: 2 });
    assert_eq!(watch.watermark(), Some(ts(T0)));
    assert_eq!(watch.owner().events(), vec!["stop", "start"]);
    assert!(lib.backup_files().is_empty());
    assert_eq!(lib.collection_count(), 0);
}

#[test]
fn test_declined_records_are_not_offered_again() {
    let lib = library_with_new_records();
    let mut watch = WatchLoop::new(lib.catalog(), off_topic, FakeOwner::new(), settings(&lib));

    let outcome = CycleOutcome::NothingProposed { detected: 2 };
    assert_eq!(watch.run_once().unwrap(), outcome);
    assert_eq!(watch.run_once().unwrap(), outcome);
    assert_eq!(watch.run_once().unwrap(), outcome);
    // the owner was only interrupted once for the same records
    assert_eq!(watch.owner().events(), vec!["stop", "start"]);

    lib.add_item("NEWITEM3", "Another preprint", "2024-01-16 08:00:00");
    assert_eq!(
        watch.run_once().unwrap(),
        CycleOutcome::NothingProposed { detected: 3 }
    );
    assert_eq!(watch.owner().events(), vec!["stop", "start", "stop", "start"]);
    assert_eq!(watch.watermark(), Some(ts(T0)));
}

#[test]
fn test_records_left_behind_the_watermark_are_reported() {
    let lib = library_with_new_records();
    let mut watch = WatchLoop::new(lib.catalog(), newest_only, FakeOwner::new(), settings(&lib));

    assert_eq!(
        watch.run_once().unwrap(),
        CycleOutcome::Applied {
            detected: 2,
            applied: 1,
            rejected: 0,
            watermark: ts(T1),
            skipped: vec![key("NEWITEM1")],
        }
    );

    // the skipped record stays unfiled and is not picked up again
    let unfiled = keys_of(&lib.catalog().open_read_only().unwrap().list_unfiled().unwrap());
    assert_eq!(unfiled, vec!["BACKLOG1", "NEWITEM1"]);
    assert_eq!(watch.run_once().unwrap(), CycleOutcome::NoNewRecords);
}

fn keys_of(records: &[Record]) -> Vec<String> {
    records.iter().map(|r| r.key.to_string()).collect()
}

#[test]
fn test_first_run_starts_from_newest_unfiled() {
    let lib = Library::new();
    lib.add_item("BACKLOG1", "Old", "2024-01-05 08:00:00");
    lib.add_item("BACKLOG2", "Older news", "2024-01-06 08:00:00");
    let mut watch = WatchLoop::new(lib.catalog(), file_into_inbox, FakeOwner::new(), settings(&lib));

    assert_eq!(watch.run_once().unwrap(), CycleOutcome::NoNewRecords);
    assert_eq!(watch.watermark(), Some(ts("2024-01-06 08:00:00")));
    assert_eq!(watermark_file(&lib).as_deref(), Some("2024-01-06 08:00:00\n"));
    assert!(watch.owner().events().is_empty());

    lib.add_item("NEWITEM1", "After start", "2024-01-07 08:00:00");
    match watch.run_once().unwrap() {
        CycleOutcome::Applied { detected, watermark, .. } => {
            assert_eq!(detected, 1);
            assert_eq!(watermark, ts("2024-01-07 08:00:00"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_empty_library_has_no_watermark() {
    let lib = Library::new();
    let mut watch = WatchLoop::new(lib.catalog(), file_into_inbox, FakeOwner::new(), settings(&lib));

    assert_eq!(watch.run_once().unwrap(), CycleOutcome::NoNewRecords);
    assert_eq!(watch.watermark(), None);
    assert!(watermark_file(&lib).is_none());

    // the first record ever added is picked up
    lib.add_item("FIRST001", "First", "2024-02-01 08:00:00");
    assert!(matches!(
        watch.run_once().unwrap(),
        CycleOutcome::Applied { detected: 1, .. }
    ));
    assert_eq!(watch.watermark(), Some(ts("2024-02-01 08:00:00")));
}

#[test]
fn test_cancel_before_stopping_owner() {
    let lib = library_with_new_records();
    let mut watch = WatchLoop::new(lib.catalog(), file_into_inbox, FakeOwner::new(), settings(&lib));
    watch.stop_handle().store(true, Ordering::SeqCst);

    assert_eq!(watch.run_once().unwrap(), CycleOutcome::Cancelled);
    assert!(watch.owner().events().is_empty());
    assert_eq!(watch.state(), WatchState::Stopped);
    assert_eq!(watch.watermark(), Some(ts(T0)));
}

#[test]
fn test_missing_database_becomes_fatal() {
    let lib = Library::new();
    let catalog = Catalog::new(lib.dir.path().join("gone.sqlite"));
    let mut watch = WatchLoop::new(catalog, file_into_inbox, FakeOwner::new(), settings(&lib));

    assert_eq!(watch.run_once().unwrap(), CycleOutcome::DatabaseMissing);
    let err = watch.run_once().expect_err("second miss should be fatal");
    assert!(matches!(err, ClerkError::DatabaseNotFound(_)));
    assert!(err.is_fatal());
}

#[test]
fn test_run_stops_on_flag() {
    let lib = library_with_new_records();
    let mut owner = FakeOwner::new();
    let mut watch_settings = settings(&lib);
    watch_settings.poll_interval = Duration::from_millis(5);

    // the restart after the first applied cycle raises the stop flag
    let placeholder = Arc::new(AtomicBool::new(false));
    owner.stop_on_start = Some(Arc::clone(&placeholder));
    let mut watch = WatchLoop::new(lib.catalog(), file_into_inbox, owner, watch_settings);
    let stop = watch.stop_handle();
    let relay = std::thread::spawn(move || {
        while !placeholder.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        stop.store(true, Ordering::SeqCst);
    });

    let stats = watch.run().expect("run failed");
    relay.join().unwrap();

    assert_eq!(watch.state(), WatchState::Stopped);
    assert_eq!(stats.records_categorized, 2);
    assert_eq!(stats.failures, 0);
    assert!(stats.cycles >= 1);
}
