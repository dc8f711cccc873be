//! Tests touching process-wide state. Kept in their own binary so that no other test emits
//! cache events while a sink is installed.

mod common;

use std::sync::Arc;

use common::{context, iota, scaled_sum, RecordingSink, TestBackend, GLOBAL_STATE_MUTEX};
use fuser_rs::events::install_global_sink;
use fuser_rs::{global_cache, reset_global_cache, ExecuteOptions, FusionContext};
use fuser_rs_backend_ref_cpu::CpuBackend;

#[test]
fn cache_events_reach_the_installed_sink() -> anyhow::Result<()> {
    let _serial = GLOBAL_STATE_MUTEX.lock().expect("global state mutex poisoned");
    let sink = Arc::new(RecordingSink::default());
    let guard = install_global_sink(sink.clone());

    let ctx = context(TestBackend::new("cpu-events"));
    let trace = scaled_sum(1, 2.0, false)?;
    let inputs = [iota(&[2]), iota(&[2])];
    ctx.backend().fail_next_compiles(1);
    assert!(ctx.execute(&trace, &inputs, &ExecuteOptions::default()).is_err());
    ctx.execute(&trace, &inputs, &ExecuteOptions::default())?;
    ctx.execute(&trace, &inputs, &ExecuteOptions::default())?;
    ctx.cache().reset();
    drop(guard);
    ctx.execute(&trace, &inputs, &ExecuteOptions::default())?;

    assert_eq!(
        sink.names(),
        vec![
            "miss",
            "compile_started",
            "compile_failed",
            "miss",
            "compile_started",
            "compile_finished",
            "hit",
            "reset",
        ]
    );
    Ok(())
}

#[test]
fn global_cache_is_shared_per_backend_type() -> anyhow::Result<()> {
    let _serial = GLOBAL_STATE_MUTEX.lock().expect("global state mutex poisoned");
    reset_global_cache::<CpuBackend>();
    let trace = scaled_sum(1, 5.0, false)?;
    let inputs = [iota(&[2]), iota(&[2])];

    let first = FusionContext::with_global_cache(Arc::new(CpuBackend::new()));
    let second = FusionContext::with_global_cache(Arc::new(CpuBackend::new()));
    assert!(Arc::ptr_eq(first.cache(), second.cache()));
    assert!(Arc::ptr_eq(first.cache(), &global_cache::<CpuBackend>()));

    first.execute(&trace, &inputs, &ExecuteOptions::default())?;
    let out = second.execute(&trace, &inputs, &ExecuteOptions::default())?;
    assert_eq!(out[0].to_vec(), vec![0.0, 10.0]);
    let stats = global_cache::<CpuBackend>().stats();
    assert_eq!((stats.compilations, stats.hits), (1, 1));

    reset_global_cache::<CpuBackend>();
    assert_eq!(second.cache().num_entries(), 0);
    Ok(())
}
