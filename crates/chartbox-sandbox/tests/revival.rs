//! Integration tests for callback revival and invocation.
//!
//! These tests verify that revival:
//! - Replaces screened string leaves with working callables
//! - Leaves rejected and broken sources as inert strings
//! - Keeps every callback in its own global scope
//! - Degrades failures (stale context, timeout, exception, memory) to `None`
//! - Honors disposal
//!
//! Tests that push the isolate to its limits are serialized.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chartbox_sandbox::{
    release, revive, revive_detailed, series_callback_paths, ConfigTree, ContextPool, OptionPath,
    SandboxConfig, SkipReason,
};
use serde_json::{json, Value};
use serial_test::serial;

fn pool() -> Arc<ContextPool> {
    ContextPool::new(SandboxConfig {
        memory_limit: 64 * 1024 * 1024,
        ..SandboxConfig::default()
    })
    .expect("pool starts")
}

fn path(raw: &str) -> OptionPath {
    raw.parse().expect("valid path")
}

async fn call_at(tree: &ConfigTree, at: &str, args: &[Value]) -> Option<Value> {
    let callback = tree
        .get_path(&path(at))
        .and_then(ConfigTree::as_callback)
        .unwrap_or_else(|| panic!("no callback at {at}"));
    callback.call(args).await
}

#[tokio::test]
async fn item_color_callback_end_to_end() {
    let pool = pool();
    let mut tree = ConfigTree::from(json!({
        "series": [{
            "type": "scatter",
            "symbolSize": 10,
            "itemStyle": { "color": "function(p){ return p.data[1] > 100 ? 'red' : 'blue'; }" }
        }]
    }));

    let ids = revive(&pool, &mut tree, &[path("series.0.itemStyle.color")]).await;
    assert_eq!(ids.len(), 1);
    assert!(pool.contains(&ids[0]).await);

    assert_eq!(
        call_at(&tree, "series.0.itemStyle.color", &[json!({ "data": [0, 150] })]).await,
        Some(json!("red"))
    );
    assert_eq!(
        call_at(&tree, "series.0.itemStyle.color", &[json!({ "data": [0, 50] })]).await,
        Some(json!("blue"))
    );
    assert_eq!(
        tree.get_path(&path("series.0.symbolSize"))
            .and_then(ConfigTree::as_f64),
        Some(10.0)
    );

    assert_eq!(release(&pool, &ids).await, 1);
    assert!(pool.is_empty().await);
    pool.dispose_all().await;
}

#[tokio::test]
async fn empty_path_list_leaves_tree_unchanged() {
    let pool = pool();
    let original = ConfigTree::from(json!({
        "series": [{ "symbolSize": "function(v){ return v[2]; }" }]
    }));
    let mut tree = original.clone();

    let ids = revive(&pool, &mut tree, &[]).await;
    assert!(ids.is_empty());
    assert_eq!(tree, original);
    assert!(pool.is_empty().await);
    pool.dispose_all().await;
}

#[tokio::test]
async fn rejected_sources_stay_inert_strings() {
    let pool = pool();
    let hostile = "function(){ return process.env; }";
    let mut tree = ConfigTree::from(json!({
        "series": [{ "symbolSize": hostile, "itemStyle": { "color": "(p) => 'red'" } }]
    }));

    let report = revive_detailed(
        &pool,
        &mut tree,
        &[path("series.0.symbolSize"), path("series.0.itemStyle.color")],
    )
    .await;

    assert!(report.context_ids.is_empty());
    assert_eq!(report.skipped.len(), 2);
    assert!(report
        .skipped
        .iter()
        .all(|s| matches!(s.reason, SkipReason::Rejected { .. })));
    assert_eq!(
        tree.get_path(&path("series.0.symbolSize"))
            .and_then(ConfigTree::as_str),
        Some(hostile)
    );
    assert_eq!(pool.metrics().rejected.load(Ordering::Relaxed), 2);
    assert!(pool.is_empty().await);
    pool.dispose_all().await;
}

#[tokio::test]
async fn missing_and_non_string_paths_are_skipped() {
    let pool = pool();
    let mut tree = ConfigTree::from(json!({ "series": [{ "symbolSize": 8 }] }));

    let report = revive_detailed(
        &pool,
        &mut tree,
        &[path("series.0.symbolSize"), path("series.3.itemStyle.color")],
    )
    .await;

    let reasons: Vec<&SkipReason> = report.skipped.iter().map(|s| &s.reason).collect();
    assert_eq!(reasons, vec![&SkipReason::NotAString, &SkipReason::Missing]);
    assert!(pool.is_empty().await);
    pool.dispose_all().await;
}

#[tokio::test]
async fn compile_failures_are_skipped_with_partial_success() {
    let pool = pool();
    let mut tree = ConfigTree::from(json!({
        "a": "function(v){ return v * 3; }",
        "b": "function(v){ return v * ; }",
        "c": "function(){}, 5",
        "d": "function(v){ return -v; }"
    }));

    let report = revive_detailed(
        &pool,
        &mut tree,
        &[path("a"), path("b"), path("c"), path("d")],
    )
    .await;

    assert_eq!(report.context_ids.len(), 2);
    assert_eq!(report.skipped.len(), 2);
    assert!(report
        .skipped
        .iter()
        .all(|s| matches!(s.reason, SkipReason::CompileFailed { .. })));

    // Contexts of failed paths were removed before the pass returned.
    assert_eq!(pool.len().await, 2);
    assert!(tree.get_path(&path("b")).and_then(ConfigTree::as_str).is_some());
    assert!(tree.get_path(&path("c")).and_then(ConfigTree::as_str).is_some());

    assert_eq!(call_at(&tree, "a", &[json!(2)]).await, Some(json!(6)));
    assert_eq!(call_at(&tree, "d", &[json!(2)]).await, Some(json!(-2)));
    pool.dispose_all().await;
}

#[tokio::test]
async fn released_context_makes_callback_return_none() {
    let pool = pool();
    let mut tree = ConfigTree::from(json!({ "f": "function(v){ return v; }" }));
    let ids = revive(&pool, &mut tree, &[path("f")]).await;

    assert_eq!(call_at(&tree, "f", &[json!(1)]).await, Some(json!(1)));
    assert!(pool.remove_context(&ids[0]).await);
    assert_eq!(call_at(&tree, "f", &[json!(1)]).await, None);
    assert_eq!(pool.metrics().stale_invocations.load(Ordering::Relaxed), 1);

    // Releasing again is a no-op.
    assert_eq!(release(&pool, &ids).await, 0);
    pool.dispose_all().await;
}

#[tokio::test]
async fn disposal_turns_callbacks_inert() {
    let pool = pool();
    let mut tree = ConfigTree::from(json!({ "f": "function(){ return 'live'; }" }));
    let ids = revive(&pool, &mut tree, &[path("f")]).await;
    assert_eq!(call_at(&tree, "f", &[]).await, Some(json!("live")));

    pool.dispose_all().await;
    assert_eq!(call_at(&tree, "f", &[]).await, None);
    assert_eq!(release(&pool, &ids).await, 0);
    assert_eq!(pool.cleanup_expired().await, 0);

    let mut fresh = ConfigTree::from(json!({ "g": "function(){ return 1; }" }));
    let report = revive_detailed(&pool, &mut fresh, &[path("g")]).await;
    assert!(report.context_ids.is_empty());
    assert!(matches!(
        report.skipped[0].reason,
        SkipReason::ContextUnavailable { .. }
    ));
}

#[tokio::test]
async fn concurrent_passes_produce_disjoint_ids() {
    let pool = pool();
    let source = "function(v){ return v + 1; }";
    let mut first = ConfigTree::from(json!({
        "series": [{ "symbolSize": source }, { "symbolSize": source }]
    }));
    let mut second = first.clone();
    let paths = [path("series.0.symbolSize"), path("series.1.symbolSize")];

    let (a, b) = tokio::join!(
        revive(&pool, &mut first, &paths),
        revive(&pool, &mut second, &paths)
    );

    assert_eq!(a.len(), 2);
    assert_eq!(b.len(), 2);
    assert!(a.iter().all(|id| !b.contains(id)));
    assert_eq!(pool.len().await, 4);

    assert_eq!(release(&pool, &a).await, 2);
    assert_eq!(
        call_at(&second, "series.0.symbolSize", &[json!(1)]).await,
        Some(json!(2))
    );
    pool.dispose_all().await;
}

#[tokio::test]
async fn globals_do_not_leak_between_callbacks() {
    let pool = pool();
    let mut tree = ConfigTree::from(json!({
        "writer": "function(v){ counter = (typeof counter === 'number' ? counter : 0) + v; return counter; }",
        "reader": "function(){ return typeof counter; }"
    }));
    revive(&pool, &mut tree, &[path("writer"), path("reader")]).await;

    assert_eq!(call_at(&tree, "writer", &[json!(5)]).await, Some(json!(5)));
    // State persists within one context for its lifetime.
    assert_eq!(call_at(&tree, "writer", &[json!(5)]).await, Some(json!(10)));
    assert_eq!(call_at(&tree, "reader", &[]).await, Some(json!("undefined")));
    pool.dispose_all().await;
}

#[tokio::test]
async fn arguments_are_copied_into_the_context() {
    let pool = pool();
    let mut tree = ConfigTree::from(json!({
        "mutate": "function(p){ p.data.push(99); p.extra = true; return p.data.length; }"
    }));
    revive(&pool, &mut tree, &[path("mutate")]).await;

    let args = [json!({ "data": [1, 2] })];
    assert_eq!(call_at(&tree, "mutate", &args).await, Some(json!(3)));
    assert_eq!(args[0], json!({ "data": [1, 2] }));
    // A second call sees a fresh copy, not the mutated one.
    assert_eq!(call_at(&tree, "mutate", &args).await, Some(json!(3)));
    pool.dispose_all().await;
}

#[tokio::test]
async fn thrown_errors_degrade_to_none() {
    let pool = pool();
    let mut tree = ConfigTree::from(json!({
        "boom": "function(p){ return p.missing.field; }",
        "ok": "function(){ return 'fine'; }"
    }));
    revive(&pool, &mut tree, &[path("boom"), path("ok")]).await;

    assert_eq!(call_at(&tree, "boom", &[json!({})]).await, None);
    assert_eq!(call_at(&tree, "ok", &[]).await, Some(json!("fine")));
    assert_eq!(pool.metrics().invocation_failures.load(Ordering::Relaxed), 1);
    pool.dispose_all().await;
}

#[tokio::test]
#[serial]
async fn timeout_degrades_to_none_and_siblings_keep_working() {
    let pool = ContextPool::new(SandboxConfig {
        invoke_timeout: Duration::from_millis(200),
        ..SandboxConfig::default()
    })
    .expect("pool starts");
    let mut tree = ConfigTree::from(json!({
        "spin": "function(){ for (;;) {} }",
        "ok": "function(v){ return v * 2; }"
    }));
    let ids = revive(&pool, &mut tree, &[path("spin"), path("ok")]).await;
    assert_eq!(ids.len(), 2);

    let started = std::time::Instant::now();
    assert_eq!(call_at(&tree, "spin", &[]).await, None);
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(call_at(&tree, "ok", &[json!(21)]).await, Some(json!(42)));
    // The timed-out context survives and times out again.
    assert!(pool.contains(&ids[0]).await);
    assert_eq!(call_at(&tree, "spin", &[]).await, None);
    pool.dispose_all().await;
}

#[tokio::test]
#[serial]
async fn heap_exhaustion_degrades_to_none() {
    let pool = ContextPool::new(SandboxConfig {
        memory_limit: 16 * 1024 * 1024,
        invoke_timeout: Duration::from_secs(30),
        ..SandboxConfig::default()
    })
    .expect("pool starts");
    let hog = "function(){ var keep = []; for (;;) { keep.push(new Array(100000).fill(1)); } }";
    let mut tree = ConfigTree::from(json!({
        "hog": hog,
        "again": hog,
        "ok": "function(v){ return v + 1; }"
    }));
    let ids = revive(&pool, &mut tree, &[path("hog"), path("again"), path("ok")]).await;
    assert_eq!(ids.len(), 3);

    assert_eq!(call_at(&tree, "hog", &[]).await, None);
    assert!(!pool.contains(&ids[0]).await, "exhausted context is removed");
    assert_eq!(call_at(&tree, "ok", &[json!(1)]).await, Some(json!(2)));

    // The ceiling is back where it started: a second hog hits it too.
    assert_eq!(call_at(&tree, "again", &[]).await, None);
    assert!(!pool.contains(&ids[1]).await);
    assert_eq!(call_at(&tree, "ok", &[json!(2)]).await, Some(json!(3)));

    assert_eq!(pool.metrics().invocation_failures.load(Ordering::Relaxed), 2);
    pool.dispose_all().await;
}

#[tokio::test]
#[serial]
async fn typed_array_allocations_count_against_the_memory_limit() {
    let pool = ContextPool::new(SandboxConfig {
        memory_limit: 16 * 1024 * 1024,
        ..SandboxConfig::default()
    })
    .expect("pool starts");
    let mut tree = ConfigTree::from(json!({
        "buffers": concat!(
            "function(){ var k = []; for (var i = 0; i < 4; i++) ",
            "{ k.push(new Uint8Array(64 * 1024 * 1024).fill(1)); } ",
            "return k.length * k[0].length; }"
        ),
        "small": concat!(
            "function(){ return new Uint8Array(1024).fill(2)",
            ".reduce(function(a, b){ return a + b; }, 0); }"
        )
    }));
    let ids = revive(&pool, &mut tree, &[path("buffers"), path("small")]).await;
    assert_eq!(ids.len(), 2);

    assert_eq!(call_at(&tree, "buffers", &[]).await, None);
    assert!(!pool.contains(&ids[0]).await);
    // Small buffers still fit in the budget.
    assert_eq!(call_at(&tree, "small", &[]).await, Some(json!(2048)));
    pool.dispose_all().await;
}

#[tokio::test]
async fn unhandled_rejections_inside_callbacks_are_harmless() {
    let pool = pool();
    let source = "function(){ Array.fromAsync(null); return 1; }";
    assert!(chartbox_sandbox::screener::accepts(source));
    let mut tree = ConfigTree::from(json!({ "reject": source }));
    let ids = revive(&pool, &mut tree, &[path("reject")]).await;
    assert_eq!(ids.len(), 1);

    assert_eq!(call_at(&tree, "reject", &[]).await, Some(json!(1)));
    assert_eq!(call_at(&tree, "reject", &[]).await, Some(json!(1)));
    pool.dispose_all().await;
}

#[tokio::test]
#[serial]
async fn compile_timeout_skips_the_path_and_keeps_siblings() {
    let pool = ContextPool::new(SandboxConfig {
        compile_timeout: Duration::from_millis(200),
        ..SandboxConfig::default()
    })
    .expect("pool starts");
    let mut tree = ConfigTree::from(json!({
        "spin": "function(){}, (function(){ for(;;){} })()",
        "ok": "function(v){ return v * 10; }"
    }));

    let started = std::time::Instant::now();
    let report = revive_detailed(&pool, &mut tree, &[path("spin"), path("ok")]).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(report.context_ids.len(), 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].path, path("spin"));
    assert!(
        matches!(report.skipped[0].reason, SkipReason::CompileFailed { .. }),
        "got {:?}",
        report.skipped[0].reason
    );
    assert!(tree.get_path(&path("spin")).and_then(ConfigTree::as_str).is_some());
    assert_eq!(pool.len().await, 1);

    assert_eq!(call_at(&tree, "ok", &[json!(3)]).await, Some(json!(30)));
    pool.dispose_all().await;
}

#[tokio::test]
async fn revived_result_matches_direct_evaluation() {
    let pool = pool();
    let mut tree = ConfigTree::from(json!({
        "series": [{ "symbolSize": "function(v){ return Math.max(4, Math.sqrt(v[2]) * 2); }" }]
    }));
    revive(&pool, &mut tree, &[path("series.0.symbolSize")]).await;

    for (value, expected) in [(json!([0, 0, 1]), 4.0), (json!([0, 0, 100]), 20.0)] {
        let out = call_at(&tree, "series.0.symbolSize", &[value])
            .await
            .and_then(|v| v.as_f64());
        assert_eq!(out, Some(expected));
    }
    pool.dispose_all().await;
}

#[tokio::test]
async fn undefined_result_is_none() {
    let pool = pool();
    let mut tree = ConfigTree::from(json!({ "f": "function(){}" }));
    revive(&pool, &mut tree, &[path("f")]).await;
    assert_eq!(call_at(&tree, "f", &[]).await, None);
    pool.dispose_all().await;
}

#[tokio::test]
async fn series_helper_paths_revive() {
    let pool = pool();
    let mut tree = ConfigTree::from(json!({
        "series": [
            { "symbolSize": "function(v){ return v[2] / 10; }", "itemStyle": { "color": "#333" } },
            { "itemStyle": { "color": "function(p){ return p.value > 0 ? 'green' : 'gray'; }" } }
        ]
    }));

    let paths = series_callback_paths(&tree);
    assert_eq!(paths.len(), 3);
    let report = revive_detailed(&pool, &mut tree, &paths).await;

    // "#333" is a plain color, not a function literal.
    assert_eq!(report.context_ids.len(), 2);
    assert_eq!(tree.callback_count(), 2);
    assert_eq!(
        call_at(&tree, "series.1.itemStyle.color", &[json!({ "value": 3 })]).await,
        Some(json!("green"))
    );
    assert_eq!(
        tree.to_json()["series"][0]["itemStyle"]["color"],
        json!("#333")
    );
    pool.dispose_all().await;
}
