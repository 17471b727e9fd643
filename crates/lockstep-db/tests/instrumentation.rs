//! Every operation is observed under its name and outcome.

mod common;

use common::open_db;
use lockstep_db::{metadata, Context};
use lockstep_observe::QUERIES_TOTAL;
use metrics_exporter_prometheus::PrometheusBuilder;

fn count(rendered: &str, operation: &str, outcome: &str) -> Option<f64> {
    let labels = [
        format!("operation=\"{operation}\""),
        format!("outcome=\"{outcome}\""),
    ];
    rendered
        .lines()
        .filter(|line| line.starts_with(&format!("{QUERIES_TOTAL}{{")))
        .find(|line| labels.iter().all(|label| line.contains(label.as_str())))
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|value| value.parse().ok())
}

#[test]
fn operations_emit_a_count_per_outcome() {
    let test = open_db(None);
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    // The local recorder is per thread, so drive the operations on this one.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime should build");

    metrics::with_local_recorder(&recorder, || {
        runtime.block_on(async {
            let ctx = Context::background();
            metadata::set_metadata(&test.db, &ctx, "present", "1")
                .await
                .expect("set should succeed");
            metadata::get_metadata(&test.db, &ctx, "present")
                .await
                .expect("get should succeed");
            metadata::get_metadata(&test.db, &ctx, "absent")
                .await
                .expect_err("absent key should fail");
        });
    });

    let rendered = handle.render();
    assert_eq!(count(&rendered, "set_metadata", "ok"), Some(1.0), "{rendered}");
    assert_eq!(count(&rendered, "get_metadata", "ok"), Some(1.0), "{rendered}");
    assert_eq!(count(&rendered, "get_metadata", "error"), Some(1.0), "{rendered}");
}

#[tokio::test(flavor = "multi_thread")]
async fn operations_without_a_recorder_still_succeed() {
    let test = open_db(None);
    let ctx = Context::background();

    metadata::set_metadata(&test.db, &ctx, "k", "v")
        .await
        .expect("set should succeed without a recorder");
    assert_eq!(
        metadata::get_metadata(&test.db, &ctx, "k").await.expect("get should succeed"),
        "v"
    );
}
