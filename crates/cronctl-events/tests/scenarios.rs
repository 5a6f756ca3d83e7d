// End-to-end behaviour against an on-disk database shared by two "processes",
// each with its own connection and registry but one shared cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cronctl_core::{now_ts, CronControlConfig, MemoryCache};
use cronctl_events::types::{hash_action, NewEventRow};
use cronctl_events::{
    ActionRegistry, Event, EventArgs, EventError, EventStatus, Events, EventsStore,
};
use rusqlite::Connection;
use serde_json::json;
use tempfile::TempDir;

struct Site {
    _dir: TempDir,
    a: Events,
    b: Events,
}

fn site() -> Site {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cronctl.db");
    let cache = Arc::new(MemoryCache::new());
    let config = CronControlConfig::default();

    let open = |cache: Arc<MemoryCache>| {
        let store = EventsStore::with_config(Connection::open(&path).unwrap(), cache, &config.events);
        Events::new(Arc::new(store), Arc::new(ActionRegistry::new()), &config)
    };
    let a = open(cache.clone());
    let b = open(cache);
    Site { _dir: dir, a, b }
}

fn counter(events: &Events, action: &str) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    events.registry().register(action, move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    calls
}

#[test]
fn recurring_digest_moves_to_next_slot() {
    let site = site();
    let calls = counter(&site.a, "send_digest");
    let ts = now_ts() - 30;
    let args = EventArgs::new(vec![json!("weekly-news")]);
    let id = site
        .a
        .schedule_recurring_event(ts, "daily", "send_digest", args.clone())
        .unwrap();

    site.a
        .run_event(ts, &hash_action("send_digest"), &args.instance(), false)
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // the other process sees the same row, pending one interval later
    let row = site.b.store().get_raw(id).unwrap();
    assert_eq!(row.status, "pending");
    assert_eq!(row.timestamp, ts + 86400);
    assert_eq!(row.instance, args.instance());
    assert_eq!(
        site.b.next_scheduled("send_digest", &args).unwrap(),
        Some(ts + 86400)
    );
}

#[test]
fn hourly_digest_runs_once_with_its_args() {
    let site = site();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    site.a.registry().register("send_digest", move |args| {
        sink.lock().unwrap().push(args.clone());
        Ok(())
    });

    let now = now_ts();
    let mut event = Event::new();
    event.set_action("send_digest");
    event.set_args(EventArgs::new(vec![json!("weekly")]));
    event.set_timestamp(now - 5);
    event.set_schedule("hourly", 3600);
    event.save(site.a.store()).unwrap();

    event.run_if_allowed(&site.a).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![EventArgs::new(vec![json!("weekly")])]);
    let row = site.b.store().get_raw(event.id().unwrap()).unwrap();
    assert_eq!(row.status, "pending");
    assert!(row.timestamp > now && row.timestamp <= now_ts() + 3600);
}

#[test]
fn one_shot_completion_frees_the_key() {
    let site = site();
    counter(&site.a, "ping");
    let ts = now_ts() - 5;
    let args = EventArgs::new(vec![json!(1)]);
    let id = site.a.schedule_single_event(ts, "ping", args.clone()).unwrap();

    site.a
        .run_event(ts, &hash_action("ping"), &args.instance(), false)
        .unwrap();

    let row = site.b.store().get_raw(id).unwrap();
    assert_eq!(row.status, "complete");
    assert_ne!(row.instance, args.instance());
    assert!(row.instance.starts_with("completed-"));

    // the same fingerprint can be scheduled again
    let again = site.b.schedule_single_event(ts, "ping", args).unwrap();
    assert_ne!(again, id);
}

#[test]
fn only_one_process_claims_an_event() {
    let site = site();
    let a_calls = counter(&site.a, "report");
    let b_calls = counter(&site.b, "report");
    let ts = now_ts() - 5;
    let id = site
        .a
        .schedule_single_event(ts, "report", EventArgs::default())
        .unwrap();

    // both load the row while it is still pending
    let mut in_a = Event::get(site.a.store(), id).unwrap();
    let mut in_b = Event::get(site.b.store(), id).unwrap();
    assert_eq!(in_b.status(), Some(EventStatus::Pending));

    in_a.run_if_allowed(&site.a).unwrap();
    let err = in_b.run_if_allowed(&site.b).unwrap_err();
    assert!(matches!(err, EventError::FailedToSetRunningStatus));

    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(b_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn uniqueness_holds_across_connections() {
    let site = site();
    let ts = now_ts() + 600;
    let args = EventArgs::new(vec![json!({"user": 42})]);
    let first = site.a.schedule_single_event(ts, "notify", args.clone()).unwrap();
    let second = site.b.schedule_single_event(ts, "notify", args.clone()).unwrap();
    assert_eq!(first, second);

    let raw = site.b.store().create(&NewEventRow {
        timestamp: ts,
        action: "notify".to_string(),
        action_hashed: hash_action("notify"),
        instance: args.instance(),
        args,
        schedule: None,
        interval: 0,
        status: EventStatus::Pending,
    });
    assert_eq!(raw, None);
    assert_eq!(site.a.store().count_by_status(EventStatus::Pending).unwrap(), 1);
}

#[test]
fn disable_flag_is_shared() {
    let site = site();
    site.a
        .schedule_single_event(now_ts() - 5, "job", EventArgs::default())
        .unwrap();
    assert_eq!(site.b.get_events().unwrap().len(), 1);

    site.a.disable_automatic_execution().unwrap();
    assert!(site.b.get_events().unwrap().is_empty());
    assert!(matches!(
        site.b
            .run_event(now_ts() - 5, &hash_action("job"), &EventArgs::default().instance(), false),
        Err(EventError::RunDisabled)
    ));

    site.b.enable_automatic_execution().unwrap();
    assert_eq!(site.a.get_events().unwrap().len(), 1);
}
