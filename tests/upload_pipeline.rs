mod common;

use audio_store::{
    models::upload::UploadResult,
    services::upload_pipeline::{
        CAUSE_INTERNAL, CAUSE_PERSIST, CAUSE_READ, CAUSE_STORAGE, CAUSE_TIMEOUT,
        PipelineSettings, UploadOwner,
    },
};
use common::{
    FAIL_STORE, Harness, LATE, PANIC_STORE, SLOW, body, broken_body, full_metadata, part_info,
};
use std::{collections::HashSet, sync::atomic::Ordering, time::Duration};

const OWNER: UploadOwner = UploadOwner {
    user_id: 7,
    playlist_id: 42,
};

fn tagged(name: &str) -> Vec<u8> {
    format!("TAGS {name} audio payload").into_bytes()
}

fn untagged(name: &str) -> Vec<u8> {
    format!("RAW {name} audio payload").into_bytes()
}

fn with_prefix(prefix: &[u8], rest: &str) -> Vec<u8> {
    let mut data = prefix.to_vec();
    data.extend_from_slice(rest.as_bytes());
    data
}

#[tokio::test]
async fn every_part_is_stored_and_recorded() {
    let h = Harness::with_defaults().await;
    let pipeline = h.pipeline();

    let mut batch = pipeline.begin(OWNER);
    for i in 0..5 {
        let name = format!("track-{i}.mp3");
        batch
            .dispatch(part_info(&name, Some("audio/mpeg")), body(&tagged(&name)))
            .await;
    }
    let results = batch.finish().await;

    let expected: Vec<UploadResult> = (0..5)
        .map(|i| UploadResult::ok(format!("track-{i}.mp3")))
        .collect();
    assert_eq!(results, expected);

    let rows = h.rows().await;
    assert_eq!(rows.len(), 5);
    let ids: HashSet<_> = rows.iter().map(|r| r.record.storage_id).collect();
    assert_eq!(ids.len(), 5);
    for row in &rows {
        assert!(h.objects.contains(row.record.storage_id));
        assert_eq!(row.record.uploaded_by, 7);
        assert_eq!(row.record.playlist_id, 42);
    }
    assert_eq!(h.objects.len(), 5);
}

#[tokio::test]
async fn stored_bytes_match_the_part_body() {
    let h = Harness::with_defaults().await;
    let data = tagged("exact");

    let mut batch = h.pipeline().begin(OWNER);
    batch
        .dispatch(part_info("exact.mp3", None), body(&data))
        .await;
    batch.finish().await;

    let row = h.row_for("exact.mp3").await.unwrap();
    let stored = h
        .objects
        .objects
        .lock()
        .unwrap()
        .get(&row.record.storage_id)
        .cloned()
        .unwrap();
    assert_eq!(stored, data);
}

#[tokio::test]
async fn tags_are_saved_with_the_record() {
    let h = Harness::with_defaults().await;

    let mut batch = h.pipeline().begin(OWNER);
    batch
        .dispatch(part_info("a.mp3", Some("audio/mpeg")), body(&tagged("a")))
        .await;
    assert_eq!(batch.finish().await, vec![UploadResult::ok("a.mp3")]);

    let record = h.row_for("a.mp3").await.unwrap().record;
    let expected = full_metadata();
    assert_eq!(record.title, expected.title);
    assert_eq!(record.album, expected.album);
    assert_eq!(record.artists, expected.artists);
    assert_eq!(record.track_number, Some(4));
    assert_eq!(record.track_total, Some(11));
    assert_eq!(record.genre.as_deref(), Some("Rock"));
    assert_eq!(record.icon, expected.icon);

    let format = record.format.unwrap();
    assert_eq!(format.mime_type.as_deref(), Some("audio/mpeg"));
    assert_eq!(format.bitrate, Some(320_000));
    assert_eq!(format.sample_rate, Some(44_100));
}

#[tokio::test]
async fn unparseable_tags_still_save_a_minimal_record() {
    let h = Harness::with_defaults().await;

    let mut batch = h.pipeline().begin(OWNER);
    batch
        .dispatch(part_info("b.mp3", None), body(&untagged("b")))
        .await;
    assert_eq!(batch.finish().await, vec![UploadResult::ok("b.mp3")]);

    let record = h.row_for("b.mp3").await.unwrap().record;
    assert!(record.is_minimal());
    assert!(h.objects.contains(record.storage_id));
}

#[tokio::test]
async fn storage_failure_writes_no_row_and_spares_siblings() {
    let h = Harness::with_defaults().await;

    let mut batch = h.pipeline().begin(OWNER);
    batch
        .dispatch(part_info("good.mp3", None), body(&tagged("good")))
        .await;
    batch
        .dispatch(
            part_info("bad.mp3", None),
            body(&with_prefix(FAIL_STORE, " bytes")),
        )
        .await;
    let results = batch.finish().await;

    assert_eq!(
        results,
        vec![
            UploadResult::ok("good.mp3"),
            UploadResult::failed("bad.mp3", CAUSE_STORAGE),
        ]
    );
    let rows = h.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].record.filename, "good.mp3");
    assert_eq!(h.objects.len(), 1);
    assert!(h.objects.delete_calls().is_empty());
}

#[tokio::test]
async fn database_failure_deletes_the_stored_object() {
    let h = Harness::with_defaults().await;

    let mut batch = h.pipeline().begin(OWNER);
    batch
        .dispatch(part_info("db-fail.mp3", None), body(&tagged("x")))
        .await;
    let results = batch.finish().await;

    assert_eq!(
        results,
        vec![UploadResult::failed("db-fail.mp3", CAUSE_PERSIST)]
    );
    assert!(h.rows().await.is_empty());
    assert_eq!(h.objects.delete_calls().len(), 1);
    assert_eq!(h.objects.len(), 0);
}

#[tokio::test]
async fn failed_rollback_keeps_the_original_cause() {
    let h = Harness::with_defaults().await;
    h.objects.fail_deletes.store(true, Ordering::SeqCst);

    let mut batch = h.pipeline().begin(OWNER);
    batch
        .dispatch(part_info("db-fail.mp3", None), body(&tagged("x")))
        .await;
    let results = batch.finish().await;

    assert_eq!(
        results,
        vec![UploadResult::failed("db-fail.mp3", CAUSE_PERSIST)]
    );
    // Left behind for the orphan sweep.
    assert_eq!(h.objects.len(), 1);
    assert!(h.rows().await.is_empty());
}

#[tokio::test]
async fn mixed_batch_reports_each_part() {
    let h = Harness::with_defaults().await;

    let mut batch = h.pipeline().begin(OWNER);
    batch
        .dispatch(part_info("A.mp3", Some("audio/mpeg")), body(&tagged("A")))
        .await;
    batch
        .dispatch(part_info("B.mp3", Some("audio/mpeg")), body(&untagged("B")))
        .await;
    batch
        .dispatch(
            part_info("C.mp3", Some("audio/mpeg")),
            body(&with_prefix(FAIL_STORE, " C")),
        )
        .await;
    let results = batch.finish().await;

    assert_eq!(
        results,
        vec![
            UploadResult::ok("A.mp3"),
            UploadResult::ok("B.mp3"),
            UploadResult::failed("C.mp3", CAUSE_STORAGE),
        ]
    );

    let a = h.row_for("A.mp3").await.unwrap().record;
    assert_eq!(a.title.as_deref(), Some("Song A"));
    let b = h.row_for("B.mp3").await.unwrap().record;
    assert!(b.is_minimal());
    assert!(h.row_for("C.mp3").await.is_none());
    assert_eq!(h.objects.len(), 2);
}

#[tokio::test]
async fn read_failure_is_reported_without_storage() {
    let h = Harness::with_defaults().await;

    let mut batch = h.pipeline().begin(OWNER);
    batch
        .dispatch(part_info("cut.mp3", None), broken_body())
        .await;
    batch
        .dispatch(part_info("after.mp3", None), body(&tagged("after")))
        .await;
    assert_eq!(batch.dispatched(), 2);
    let results = batch.finish().await;

    assert_eq!(
        results,
        vec![
            UploadResult::failed("cut.mp3", CAUSE_READ),
            UploadResult::ok("after.mp3"),
        ]
    );
    assert_eq!(h.objects.len(), 1);
    assert_eq!(h.rows().await.len(), 1);
}

#[tokio::test]
async fn panicking_part_reports_an_internal_error() {
    let h = Harness::with_defaults().await;

    let mut batch = h.pipeline().begin(OWNER);
    batch
        .dispatch(
            part_info("boom.mp3", None),
            body(&with_prefix(PANIC_STORE, " payload")),
        )
        .await;
    batch
        .dispatch(part_info("fine.mp3", None), body(&tagged("fine")))
        .await;
    let results = batch.finish().await;

    assert_eq!(
        results,
        vec![
            UploadResult::failed("boom.mp3", CAUSE_INTERNAL),
            UploadResult::ok("fine.mp3"),
        ]
    );
    assert_eq!(h.rows().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn more_parts_than_channel_slots_do_not_stall() {
    let h = Harness::new(PipelineSettings {
        result_channel_capacity: 1,
        upload_timeout: Duration::from_secs(30),
        ..PipelineSettings::default()
    })
    .await;

    let mut batch = h.pipeline().begin(OWNER);
    for i in 0..40 {
        let name = format!("many-{i}.mp3");
        batch
            .dispatch(part_info(&name, None), body(&tagged(&name)))
            .await;
    }
    let results = batch.finish().await;

    assert_eq!(results.len(), 40);
    assert!(results.iter().all(UploadResult::is_ok));
    assert_eq!(h.rows().await.len(), 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_uploads_do_not_interfere() {
    let h = Harness::with_defaults().await;
    let pipeline = h.pipeline();

    let upload = |prefix: &'static str, playlist_id: i64| {
        let pipeline = pipeline.clone();
        async move {
            let mut batch = pipeline.begin(UploadOwner {
                user_id: 7,
                playlist_id,
            });
            for i in 0..3 {
                let name = format!("{prefix}-{i}.mp3");
                batch
                    .dispatch(part_info(&name, None), body(&tagged(&name)))
                    .await;
            }
            batch.finish().await
        }
    };
    let (first, second) = tokio::join!(upload("left", 1), upload("right", 2));

    assert_eq!(
        first,
        (0..3)
            .map(|i| UploadResult::ok(format!("left-{i}.mp3")))
            .collect::<Vec<_>>()
    );
    assert_eq!(
        second,
        (0..3)
            .map(|i| UploadResult::ok(format!("right-{i}.mp3")))
            .collect::<Vec<_>>()
    );

    let rows = h.rows().await;
    assert_eq!(rows.len(), 6);
    let ids: HashSet<_> = rows.iter().map(|r| r.record.storage_id).collect();
    assert_eq!(ids.len(), 6);
    for row in rows {
        let expected = if row.record.filename.starts_with("left") { 1 } else { 2 };
        assert_eq!(row.record.playlist_id, expected);
    }
}

#[tokio::test]
async fn timeout_cancels_outstanding_parts() {
    let h = Harness::new(PipelineSettings {
        upload_timeout: Duration::from_millis(200),
        ..PipelineSettings::default()
    })
    .await;

    let mut batch = h.pipeline().begin(OWNER);
    batch
        .dispatch(part_info("quick.mp3", None), body(&tagged("quick")))
        .await;
    batch
        .dispatch(
            part_info("stuck.mp3", None),
            body(&with_prefix(SLOW, " payload")),
        )
        .await;
    let results = batch.finish().await;

    assert_eq!(
        results,
        vec![
            UploadResult::ok("quick.mp3"),
            UploadResult::failed("stuck.mp3", CAUSE_TIMEOUT),
        ]
    );

    // Give the cancelled task a moment to unwind.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.row_for("stuck.mp3").await.is_none());
    assert_eq!(h.objects.len(), 1);
}

#[tokio::test]
async fn upload_finishing_after_timeout_is_rolled_back() {
    let h = Harness::new(PipelineSettings {
        upload_timeout: Duration::from_millis(100),
        ..PipelineSettings::default()
    })
    .await;

    let mut batch = h.pipeline().begin(OWNER);
    batch
        .dispatch(
            part_info("late.mp3", None),
            body(&with_prefix(LATE, " payload")),
        )
        .await;
    let results = batch.finish().await;

    assert_eq!(
        results,
        vec![UploadResult::failed("late.mp3", CAUSE_TIMEOUT)]
    );

    // The store ignores the token, so the part only sees the cancellation
    // once its upload returns.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(h.rows().await.is_empty());
    assert_eq!(h.objects.delete_calls().len(), 1);
    assert_eq!(h.objects.len(), 0);
}

#[tokio::test]
async fn buffers_return_to_the_pool() {
    let h = Harness::with_defaults().await;
    let pipeline = h.pipeline();
    assert_eq!(pipeline.buffers().idle_count(), 0);

    let mut batch = pipeline.begin(OWNER);
    batch
        .dispatch(part_info("a.mp3", None), body(&tagged("a")))
        .await;
    batch
        .dispatch(part_info("cut.mp3", None), broken_body())
        .await;
    batch
        .dispatch(
            part_info("c.mp3", None),
            body(&with_prefix(FAIL_STORE, " c")),
        )
        .await;
    batch.finish().await;

    let idle = pipeline.buffers().idle_count();
    assert!(idle >= 1, "expected buffers back in the pool, found {idle}");
    let reused = pipeline.buffers().acquire();
    assert!(reused.is_empty());
}
