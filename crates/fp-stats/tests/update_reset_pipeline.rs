use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use fp_core::{Category, CrashReport, Heartbeat, VersionDimension};
use fp_stats::StatsEngine;
use fp_storage::StatsStore;

fn ts(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0)
        .single()
        .expect("valid timestamp")
}

fn day(value: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, value).expect("valid day")
}

fn heartbeat(device: &str, fingerprint: &str, reported: DateTime<Utc>) -> Heartbeat {
    Heartbeat {
        device_id: device.to_string(),
        build_fingerprint: fingerprint.to_string(),
        radio_version: Some("radio-1".to_string()),
        reported_at: reported,
        ingested_at: reported,
    }
}

fn crash(device: &str, fingerprint: &str, reason: &str, reported: DateTime<Utc>) -> CrashReport {
    CrashReport {
        device_id: device.to_string(),
        build_fingerprint: fingerprint.to_string(),
        radio_version: Some("radio-1".to_string()),
        boot_reason: reason.to_string(),
        reported_at: reported,
        ingested_at: reported,
    }
}

fn engine() -> StatsEngine {
    StatsEngine::standard().expect("standard engine")
}

#[test]
fn per_fingerprint_heartbeat_counts_match_submissions() {
    let store = StatsStore::open_in_memory().expect("open db");
    let counts: [(&str, i64); 4] = [("F1", 10), ("F2", 7), ("F3", 8), ("F4", 5)];
    for (index, (fingerprint, count)) in counts.iter().enumerate() {
        for minute in 0..*count {
            let device = format!("device-{index}");
            store
                .insert_heartbeat(&heartbeat(&device, fingerprint, ts(5, 9, minute as u32)))
                .expect("insert heartbeat");
        }
    }

    let report = engine()
        .update_window(&store, None, ts(6, 0, 0))
        .expect("update");

    for (fingerprint, count) in counts {
        let general = store
            .general_stats(VersionDimension::OsBuild, fingerprint)
            .expect("load general")
            .expect("general present");
        assert_eq!(general.heartbeats, count, "{fingerprint}");
        assert_eq!(general.first_seen_on, day(5));
    }
    assert_eq!(
        store
            .general_stats_count(VersionDimension::OsBuild)
            .expect("count"),
        4
    );
    assert_eq!(report.created("Version"), 4);
    assert_eq!(report.created("VersionDaily"), 4);
}

#[test]
fn counter_additivity_across_devices() {
    let store = StatsStore::open_in_memory().expect("open db");
    let devices = 3;
    let per_device = 4;
    for device in 0..devices {
        for minute in 0..per_device {
            store
                .insert_heartbeat(&heartbeat(
                    &format!("device-{device}"),
                    "F1",
                    ts(5, 10, device * 10 + minute),
                ))
                .expect("insert heartbeat");
        }
    }

    engine()
        .update_window(&store, None, ts(6, 0, 0))
        .expect("update");

    let expected = i64::from(devices * per_device);
    let general = store
        .general_stats(VersionDimension::OsBuild, "F1")
        .expect("load")
        .expect("present");
    assert_eq!(general.heartbeats, expected);

    let daily = store
        .daily_stats(VersionDimension::OsBuild, "F1")
        .expect("daily");
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0].heartbeats, expected);
}

#[test]
fn scheduled_reset_backdates_first_seen_across_two_runs() {
    let store = StatsStore::open_in_memory().expect("open db");
    let engine = engine();

    store
        .insert_crash_report(&crash("d1", "F1", "RTC alarm", ts(10, 9, 0)))
        .expect("first crash");
    engine
        .update_window(&store, None, ts(10, 12, 0))
        .expect("first run");

    // The same device reports an RTC alarm from a week earlier; the late
    // event must backdate first_seen_on while the counter keeps adding up.
    let mut earlier = crash("d1", "F1", "RTC alarm", ts(3, 9, 0));
    earlier.ingested_at = ts(11, 9, 0);
    store.insert_crash_report(&earlier).expect("older crash");
    engine
        .update_window(&store, store.latest_checkpoint().expect("lower"), ts(11, 12, 0))
        .expect("second run");

    let general = store
        .general_stats(VersionDimension::OsBuild, "F1")
        .expect("load")
        .expect("present");
    assert_eq!(general.scheduled_resets, 2);
    assert_eq!(general.first_seen_on, day(3));
    assert_eq!(general.released_on, day(3));
}

#[test]
fn first_seen_is_minimum_day_regardless_of_arrival_order() {
    let store = StatsStore::open_in_memory().expect("open db");
    let engine = engine();

    let report_days = [12u32, 4, 9, 7];
    for (index, report_day) in report_days.iter().enumerate() {
        let mut event = heartbeat("d1", "F1", ts(*report_day, 8, 0));
        event.ingested_at = ts(15, index as u32, 0);
        store.insert_heartbeat(&event).expect("insert");
        // One run per arrival, deliberately out of day order.
        engine
            .update_window(
                &store,
                store.latest_checkpoint().expect("lower"),
                ts(15, index as u32, 30),
            )
            .expect("run");
    }

    let general = store
        .general_stats(VersionDimension::OsBuild, "F1")
        .expect("load")
        .expect("present");
    assert_eq!(general.first_seen_on, day(4));
    assert_eq!(general.heartbeats, 4);
}

#[test]
fn manual_released_on_survives_even_earlier_events() {
    let store = StatsStore::open_in_memory().expect("open db");
    let engine = engine();

    store
        .insert_heartbeat(&heartbeat("d1", "F1", ts(10, 9, 0)))
        .expect("insert");
    engine
        .update_window(&store, None, ts(10, 12, 0))
        .expect("first run");

    store
        .set_released_on(VersionDimension::OsBuild, "F1", day(8))
        .expect("override");

    let mut earlier = heartbeat("d1", "F1", ts(2, 9, 0));
    earlier.ingested_at = ts(11, 9, 0);
    store.insert_heartbeat(&earlier).expect("insert earlier");
    engine
        .update_window(&store, store.latest_checkpoint().expect("lower"), ts(11, 12, 0))
        .expect("second run");

    let general = store
        .general_stats(VersionDimension::OsBuild, "F1")
        .expect("load")
        .expect("present");
    assert_eq!(general.first_seen_on, day(2));
    assert_eq!(general.released_on, day(8), "manual override must be frozen");
}

#[test]
fn categories_are_mutually_exclusive_through_the_engine() {
    let store = StatsStore::open_in_memory().expect("open db");

    store
        .insert_heartbeat(&heartbeat("d1", "F1", ts(5, 8, 0)))
        .expect("heartbeat");
    store
        .insert_crash_report(&crash("d1", "F1", "RTC alarm", ts(5, 9, 0)))
        .expect("scheduled");
    store
        .insert_crash_report(&crash("d1", "F1", "keyboard power on", ts(5, 10, 0)))
        .expect("unexpected");
    store
        .insert_crash_report(&crash("d1", "F1", "thermal shutdown", ts(5, 11, 0)))
        .expect("other");

    engine()
        .update_window(&store, None, ts(6, 0, 0))
        .expect("update");

    let general = store
        .general_stats(VersionDimension::OsBuild, "F1")
        .expect("load")
        .expect("present");
    assert_eq!(general.heartbeats, 1);
    assert_eq!(general.scheduled_resets, 1);
    assert_eq!(general.unexpected_resets, 1);
    assert_eq!(general.other, 1);

    let daily = store
        .daily_stats(VersionDimension::OsBuild, "F1")
        .expect("daily");
    assert_eq!(daily.len(), 1);
    for category in Category::all() {
        assert_eq!(daily[0].counter(category), 1, "{category}");
    }
}

#[test]
fn event_at_prior_upper_bound_is_not_recounted() {
    let store = StatsStore::open_in_memory().expect("open db");
    let engine = engine();
    let boundary = ts(5, 12, 0);

    let mut event = heartbeat("d1", "F1", ts(5, 9, 0));
    event.ingested_at = boundary;
    store.insert_heartbeat(&event).expect("insert");

    // Upper bound inclusive: counted by the run that ends exactly at its
    // ingestion time.
    engine
        .update_window(&store, None, boundary)
        .expect("first run");
    assert_eq!(store.latest_checkpoint().expect("checkpoint"), Some(boundary));

    // Lower bound exclusive: the follow-up run starting at the committed
    // checkpoint sees nothing.
    let report = engine
        .update_window(&store, Some(boundary), ts(6, 12, 0))
        .expect("second run");
    assert!(report.is_empty());

    let general = store
        .general_stats(VersionDimension::OsBuild, "F1")
        .expect("load")
        .expect("present");
    assert_eq!(general.heartbeats, 1);
}

#[test]
fn radio_dimension_aggregates_in_the_same_run() {
    let store = StatsStore::open_in_memory().expect("open db");

    store
        .insert_heartbeat(&heartbeat("d1", "F1", ts(5, 9, 0)))
        .expect("modern");
    let mut legacy = heartbeat("d2", "F1", ts(5, 10, 0));
    legacy.radio_version = None;
    store.insert_heartbeat(&legacy).expect("legacy");

    engine()
        .update_window(&store, None, ts(6, 0, 0))
        .expect("update");

    let os = store
        .general_stats(VersionDimension::OsBuild, "F1")
        .expect("load os")
        .expect("os present");
    assert_eq!(os.heartbeats, 2);

    let radio = store
        .general_stats(VersionDimension::Radio, "radio-1")
        .expect("load radio")
        .expect("radio present");
    assert_eq!(radio.heartbeats, 1);
}

#[test]
fn reset_then_update_reproduces_counters() {
    let store = StatsStore::open_in_memory().expect("open db");
    let engine = engine();

    store
        .insert_heartbeat(&heartbeat("d1", "F1", ts(5, 9, 0)))
        .expect("hb");
    store
        .insert_heartbeat(&heartbeat("d2", "F1", ts(5, 9, 30)))
        .expect("hb");
    store
        .insert_crash_report(&crash("d1", "F1", "RTC alarm", ts(6, 9, 0)))
        .expect("crash");
    store
        .insert_crash_report(&crash("d2", "F2", "UNKNOWN", ts(7, 9, 0)))
        .expect("crash");

    engine.update(&store).expect("first full update");
    let before_f1 = store
        .general_stats(VersionDimension::OsBuild, "F1")
        .expect("load")
        .expect("present");
    let before_f2 = store
        .general_stats(VersionDimension::OsBuild, "F2")
        .expect("load")
        .expect("present");
    let before_daily = store
        .daily_stats(VersionDimension::OsBuild, "F1")
        .expect("daily");

    let (deleted, _) = engine.reset(&store).expect("reset and rebuild");
    assert_eq!(deleted.versions, 2);
    assert!(deleted.checkpoints >= 1);

    let after_f1 = store
        .general_stats(VersionDimension::OsBuild, "F1")
        .expect("load")
        .expect("present");
    let after_f2 = store
        .general_stats(VersionDimension::OsBuild, "F2")
        .expect("load")
        .expect("present");
    let after_daily = store
        .daily_stats(VersionDimension::OsBuild, "F1")
        .expect("daily");

    assert_eq!(before_f1, after_f1);
    assert_eq!(before_f2, after_f2);
    assert_eq!(before_daily, after_daily);
}

#[test]
fn reset_on_empty_store_deletes_nothing_and_leaves_no_checkpoint_behind() {
    let store = StatsStore::open_in_memory().expect("open db");
    let (deleted, report) = engine().reset(&store).expect("reset");

    assert_eq!(deleted.versions, 0);
    assert_eq!(deleted.version_dailies, 0);
    assert_eq!(deleted.radio_versions, 0);
    assert_eq!(deleted.radio_version_dailies, 0);
    assert_eq!(deleted.checkpoints, 0);
    assert!(report.is_empty());
    // The rebuild pass itself commits a fresh checkpoint.
    assert!(store.latest_checkpoint().expect("checkpoint").is_some());
}

#[test]
fn update_report_counts_created_and_updated_entities() {
    let store = StatsStore::open_in_memory().expect("open db");
    let engine = engine();

    store
        .insert_heartbeat(&heartbeat("d1", "F1", ts(5, 9, 0)))
        .expect("hb");
    let first = engine
        .update_window(&store, None, ts(5, 12, 0))
        .expect("first run");
    assert_eq!(first.created("Version"), 1);
    assert_eq!(first.created("VersionDaily"), 1);
    assert_eq!(first.created("RadioVersion"), 1);
    assert_eq!(first.updated("Version", Category::Heartbeat), 0);

    let mut second_event = heartbeat("d1", "F1", ts(5, 10, 0));
    second_event.ingested_at = ts(6, 9, 0);
    store.insert_heartbeat(&second_event).expect("hb");
    let second = engine
        .update_window(&store, Some(ts(5, 12, 0)), ts(6, 12, 0))
        .expect("second run");
    assert_eq!(second.created("Version"), 0);
    assert_eq!(second.updated("Version", Category::Heartbeat), 1);
    assert_eq!(second.updated("VersionDaily", Category::Heartbeat), 1);
}
