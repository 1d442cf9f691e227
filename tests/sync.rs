//! Sync passes between a local [`Cache`] and a mocked server

use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};

use agenda_sync::{Cache, Event, EventTime, Provider};
use agenda_sync::calendar::CalendarId;
use agenda_sync::calendar::preference::CollectionPreference;
use agenda_sync::config::SyncSettings;
use agenda_sync::error::Error;
use agenda_sync::item::{ChangeToken, SyncStatus};
use agenda_sync::mock::MockRemote;
use agenda_sync::mock_behaviour::MockBehaviour;
use agenda_sync::provider::push::PushOutcome;
use agenda_sync::provider::sync_progress::{feedback_channel, SyncEvent, SyncPhase};
use agenda_sync::traits::{LocalStore, SyncSlave};

const WORK: &str = "https://mock.example.com/alice/work/";

fn fast_settings() -> SyncSettings {
    SyncSettings {
        retry_base_delay_ms: 1,
        confirm_delay_ms: 1,
        ..SyncSettings::default()
    }
}

fn meeting(uid: &str, day: u32) -> Event {
    let start = EventTime::utc(Utc.with_ymd_and_hms(2026, 3, day, 14, 0, 0).unwrap());
    let end = EventTime::utc(Utc.with_ymd_and_hms(2026, 3, day, 15, 0, 0).unwrap());
    Event::with_uid(uid.to_string(), format!("Meeting {}", uid), start, end)
}

/// A server with a single calendar, that holds `count` events
fn populated_remote(count: u32) -> (MockRemote, CalendarId) {
    let remote = MockRemote::new();
    let work = remote.add_collection(WORK, "Work").unwrap();
    for i in 1..=count {
        remote.insert_event(&work, &meeting(&format!("ev-{}", i), i)).unwrap();
    }
    (remote, work)
}

fn provider_for(remote: MockRemote) -> Provider<Cache, MockRemote> {
    Provider::new(remote, Cache::in_memory("alice"), fast_settings())
}


#[tokio::test]
async fn first_sync_downloads_everything() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (remote, work) = populated_remote(7);
    let provider = provider_for(remote);

    let report = provider.sync().await.unwrap();
    assert!(report.is_success(), "{}", report);
    assert_eq!(report.phase, SyncPhase::Completed);
    assert_eq!(report.created, 7);
    assert_eq!(report.fetches, 7);
    assert_eq!(provider.remote().fetch_count(), 7);

    let local = provider.local().await;
    assert_eq!(local.rows(&work).len(), 7);
    assert!(local.rows(&work).iter().all(|row| row.sync_status == SyncStatus::Synced));
    assert!(local.get_last_sync().is_some());
}

#[tokio::test]
async fn unchanged_resources_are_not_downloaded_again() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (remote, work) = populated_remote(5);
    let provider = provider_for(remote);
    provider.sync().await.unwrap();

    // Nothing moved: the collection token is enough
    let report = provider.sync().await.unwrap();
    assert_eq!(report.fetches, 0);
    assert_eq!(report.unchanged, 5);

    // A single change: only this one is downloaded
    let mut changed = meeting("ev-3", 3);
    changed.set_title("Moved meeting".to_string());
    provider.remote().insert_event(&work, &changed).unwrap();
    let report = provider.sync().await.unwrap();
    assert_eq!(report.fetches, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(report.unchanged, 4);
    assert_eq!(provider.remote().fetch_count(), 6);
    assert_eq!(provider.local().await.find_row(&work, "ev-3").unwrap().event.title(), "Moved meeting");
}

#[tokio::test]
async fn local_edits_are_pushed_with_their_last_known_token() {
    let _ = env_logger::builder().is_test(true).try_init();
    let remote = MockRemote::new();
    let work = remote.add_collection(WORK, "Work").unwrap();
    let body = agenda_sync::ical::build_from(&meeting("ev-1", 1)).unwrap();
    let original = remote.insert_raw(&work, "ev-1", body, ChangeToken::from("a1")).unwrap();
    let provider = provider_for(remote);
    provider.sync().await.unwrap();

    let row = {
        let mut local = provider.local().await;
        let row = local.find_row(&work, "ev-1").unwrap().clone();
        assert_eq!(row.event.change_token(), Some(&ChangeToken::from("a1")));
        let mut edited = row.event.clone();
        edited.set_title("Renamed".to_string());
        local.update_local_event(row.id, edited).unwrap();
        row.id
    };

    let report = provider.sync().await.unwrap();
    assert!(report.is_success(), "{}", report);
    assert_eq!(report.pushed, 1);

    let (href, precondition) = provider.remote().put_log().last().cloned().unwrap();
    assert_eq!(&href, original.href());
    assert_eq!(precondition, Some(ChangeToken::from("a1")));

    let stored = provider.remote().resource(original.href()).unwrap().unwrap();
    assert!(stored.change_token() != Some(&ChangeToken::from("a1")));
    assert!(stored.body.contains("Renamed"));

    let local = provider.local().await;
    let record = local.sync_record(row).await.unwrap().unwrap();
    assert_eq!(record.remote_change_token.as_ref(), stored.change_token());
    assert_eq!(local.row(row).await.unwrap().unwrap().sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn local_creations_and_deletions_reach_the_server() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (remote, work) = populated_remote(2);
    let provider = provider_for(remote);
    provider.sync().await.unwrap();

    {
        let mut local = provider.local().await;
        local.create_local_event(&work, meeting("new-one", 20)).unwrap();
        let doomed = local.find_row(&work, "ev-1").unwrap().id;
        local.mark_for_deletion(doomed).unwrap();
    }

    let report = provider.sync().await.unwrap();
    assert!(report.is_success(), "{}", report);
    assert_eq!(report.pushed, 1);
    assert_eq!(report.remote_deleted, 1);
    assert_eq!(provider.remote().resource_count(&work).unwrap(), 2);

    let local = provider.local().await;
    assert!(local.find_row(&work, "ev-1").is_none());
    assert!(local.list_dirty_rows(&work).await.unwrap().is_empty());
}

#[tokio::test]
async fn deleting_a_resource_that_is_already_gone_succeeds() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (remote, work) = populated_remote(1);
    let provider = provider_for(remote);
    provider.sync().await.unwrap();

    let (row, href) = {
        let mut local = provider.local().await;
        let row = local.find_row(&work, "ev-1").unwrap().id;
        local.mark_for_deletion(row).unwrap();
        let href = local.sync_record(row).await.unwrap().unwrap().remote_href;
        (row, href)
    };
    // Another client was faster
    provider.remote().remove(&href).unwrap();

    assert_eq!(provider.push_now(row).await.unwrap(), PushOutcome::Deleted);
    assert_eq!(provider.remote().delete_count(), 1);
    assert!(provider.local().await.row(row).await.unwrap().is_none());
}

#[tokio::test]
async fn remote_wins_conflicts() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (remote, work) = populated_remote(3);
    let provider = provider_for(remote);
    provider.sync().await.unwrap();

    {
        let mut local = provider.local().await;
        let row = local.find_row(&work, "ev-2").unwrap().clone();
        let mut edited = row.event.clone();
        edited.set_title("Local title".to_string());
        local.update_local_event(row.id, edited).unwrap();
    }
    let mut theirs = meeting("ev-2", 2);
    theirs.set_title("Server title".to_string());
    provider.remote().insert_event(&work, &theirs).unwrap();

    let report = provider.sync().await.unwrap();
    assert_eq!(report.conflicts, vec!["ev-2".to_string()]);
    assert_eq!(report.pushed, 0);

    let local = provider.local().await;
    let row = local.find_row(&work, "ev-2").unwrap();
    assert_eq!(row.event.title(), "Server title");
    assert_eq!(row.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn remote_deletions_are_applied_locally() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (remote, work) = populated_remote(3);
    let provider = provider_for(remote);
    provider.sync().await.unwrap();

    let href = {
        let local = provider.local().await;
        let row = local.find_row(&work, "ev-1").unwrap().id;
        local.sync_record(row).await.unwrap().unwrap().remote_href
    };
    provider.remote().remove(&href).unwrap();

    let report = provider.sync().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.unchanged, 2);
    assert!(provider.local().await.find_row(&work, "ev-1").is_none());
}

#[tokio::test]
async fn rejected_credentials_abort_the_pass() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (remote, work) = populated_remote(2);
    remote.reject_credentials(true).unwrap();
    let provider = provider_for(remote);

    match provider.sync().await {
        Err(Error::Auth { .. }) => (),
        other => panic!("unexpected {:?}", other.map(|report| report.to_string())),
    }
    assert!(provider.local().await.rows(&work).is_empty());
    assert!(provider.local().await.get_last_sync().is_none());
}

#[tokio::test]
async fn transport_failures_are_retried() {
    let _ = env_logger::builder().is_test(true).try_init();
    let behaviour = Arc::new(Mutex::new(MockBehaviour {
        list_collections_behaviour: (0, 1),
        fetch_behaviour: (1, 2),
        ..MockBehaviour::default()
    }));
    let remote = MockRemote::with_behaviour(behaviour);
    let work = remote.add_collection(WORK, "Work").unwrap();
    for i in 1..=4 {
        remote.insert_event(&work, &meeting(&format!("ev-{}", i), i)).unwrap();
    }
    let provider = provider_for(remote);

    let report = provider.sync().await.unwrap();
    assert!(report.is_success(), "{}", report);
    assert_eq!(report.created, 4);
}

#[tokio::test]
async fn failed_downloads_are_picked_up_by_the_next_pass() {
    let _ = env_logger::builder().is_test(true).try_init();
    let behaviour = Arc::new(Mutex::new(MockBehaviour {
        fetch_behaviour: (2, 1000),
        ..MockBehaviour::default()
    }));
    let remote = MockRemote::with_behaviour(behaviour.clone());
    let work = remote.add_collection(WORK, "Work").unwrap();
    for i in 1..=5 {
        remote.insert_event(&work, &meeting(&format!("ev-{}", i), i)).unwrap();
    }
    let provider = provider_for(remote);

    let report = provider.sync().await.unwrap();
    assert_eq!(report.phase, SyncPhase::CompletedWithErrors);
    assert_eq!(report.created, 2);
    assert_eq!(report.errors.len(), 3);
    assert!(report.errors.iter().all(|err| err.collection.as_ref() == Some(&work)));

    behaviour.lock().unwrap().suspend();
    let report = provider.sync().await.unwrap();
    assert!(report.is_success(), "{}", report);
    assert_eq!(report.created, 3);
    assert_eq!(report.unchanged, 2);
    assert_eq!(provider.local().await.rows(&work).len(), 5);
}

#[tokio::test]
async fn disabled_and_hidden_collections_are_skipped() {
    let _ = env_logger::builder().is_test(true).try_init();
    let remote = MockRemote::new();
    let work = remote.add_collection(WORK, "Work").unwrap();
    let home = remote.add_collection("https://mock.example.com/alice/home/", "Home").unwrap();
    let archive = remote.add_collection("https://mock.example.com/alice/_archive/", "Archive").unwrap();
    for col in &[&work, &home, &archive] {
        remote.insert_event(col, &meeting("ev-1", 1)).unwrap();
    }
    let provider = provider_for(remote);

    let views = provider.list_collections().await.unwrap();
    assert_eq!(views.len(), 3);
    let archive_view = views.iter().find(|view| view.id() == &archive).unwrap();
    assert!(archive_view.is_enabled() == false);

    let mut home_preference = views.iter().find(|view| view.id() == &home).unwrap().preference.clone();
    home_preference.is_enabled = false;
    provider.set_collection_preference(home_preference).await.unwrap();

    let report = provider.sync().await.unwrap();
    assert_eq!(report.created, 1);
    {
        let local = provider.local().await;
        assert_eq!(local.rows(&work).len(), 1);
        assert!(local.rows(&home).is_empty());
        assert!(local.rows(&archive).is_empty());
    }

    provider.set_collection_preference(CollectionPreference {
        collection_id: home.clone(),
        is_enabled: true,
        display_color: agenda_sync::calendar::default_color(),
    }).await.unwrap();
    let report = provider.sync().await.unwrap();
    assert_eq!(report.created, 1);
    assert_eq!(provider.local().await.rows(&home).len(), 1);
}

#[tokio::test]
async fn include_all_ignores_preferences() {
    let _ = env_logger::builder().is_test(true).try_init();
    let remote = MockRemote::new();
    let archive = remote.add_collection("https://mock.example.com/alice/_archive/", "Archive").unwrap();
    remote.insert_event(&archive, &meeting("old", 1)).unwrap();
    let settings = SyncSettings { include_all: true, ..fast_settings() };
    let provider = Provider::new(remote, Cache::in_memory("alice"), settings);

    let report = provider.sync().await.unwrap();
    assert_eq!(report.created, 1);
}

#[tokio::test]
async fn feedback_reports_the_end_of_the_pass() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (remote, _) = populated_remote(4);
    let provider = provider_for(remote);
    let (sender, receiver) = feedback_channel();
    assert_eq!(*receiver.borrow(), SyncEvent::NotStarted);

    let report = provider.sync_with_feedback(sender).await.unwrap();
    assert!(report.is_success());
    assert_eq!(*receiver.borrow(), SyncEvent::Finished { success: true });
}

#[tokio::test]
async fn pushed_events_survive_a_lagging_listing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let remote = MockRemote::new();
    let work = remote.add_collection(WORK, "Work").unwrap();
    // Our writes only show up in the third listing
    remote.delay_visibility(2).unwrap();
    let provider = provider_for(remote);

    let row = provider.local().await.create_local_event(&work, meeting("late", 12)).unwrap();
    let report = provider.sync().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert!(provider.local().await.sync_record(row).await.unwrap().unwrap().awaiting_listing);

    for _ in 0..2 {
        let report = provider.sync().await.unwrap();
        assert!(report.is_success(), "{}", report);
        assert_eq!(report.deleted, 0);
        assert!(provider.local().await.find_row(&work, "late").is_some());
    }

    // Listed at last: nothing is downloaded, the token of the push is kept
    let report = provider.sync().await.unwrap();
    assert_eq!(report.fetches, 0);
    assert_eq!(report.unchanged, 1);
    let record = provider.local().await.sync_record(row).await.unwrap().unwrap();
    assert!(record.awaiting_listing == false);

    // From now on, a disappearance is a real deletion
    provider.remote().remove(&record.remote_href).unwrap();
    let report = provider.sync().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(provider.local().await.find_row(&work, "late").is_none());
}

#[tokio::test]
async fn malformed_resources_do_not_stop_the_pass() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (remote, work) = populated_remote(2);
    let broken = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:broken\r\nDTSTART:not-a-date\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
    remote.insert_raw(&work, "broken", broken.to_string(), ChangeToken::from("b1")).unwrap();
    let provider = provider_for(remote);

    let report = provider.sync().await.unwrap();
    assert_eq!(report.phase, SyncPhase::CompletedWithErrors);
    assert_eq!(report.created, 2);
    assert_eq!(report.errors.len(), 1);
    match &report.errors[0].error {
        Error::Protocol { payload, .. } => assert!(payload.contains("not-a-date")),
        other => panic!("unexpected {:?}", other),
    }
    assert!(provider.local().await.find_row(&work, "broken").is_none());

    // The collection token has not been stored, the broken resource is tried again
    let report = provider.sync().await.unwrap();
    assert_eq!(report.fetches, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.unchanged, 2);
}

#[tokio::test]
async fn duplicate_listings_are_reported() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (remote, work) = populated_remote(3);
    let href = agenda_sync::resource::href_for_uid(&work, "ev-2").unwrap();
    remote.list_twice(&href).unwrap();
    let provider = provider_for(remote);

    let report = provider.sync().await.unwrap();
    assert!(report.is_success(), "{}", report);
    assert_eq!(report.duplicates, vec![href.to_string()]);
    assert_eq!(report.created, 3);
    assert_eq!(report.fetches, 3);
}

#[tokio::test]
async fn the_local_store_is_shared_with_spawned_tasks() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (remote, work) = populated_remote(1);
    let provider = provider_for(remote);
    assert_eq!(provider.settings().retry_base_delay_ms, 1);

    let handle = provider.local_handle();
    let collection = work.clone();
    tokio::spawn(async move {
        handle.lock().await.create_local_event(&collection, meeting("offline", 9)).unwrap();
    }).await.unwrap();

    let report = provider.sync().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(provider.remote().resource_count(&work).unwrap(), 2);
}
