mod common;

use std::fs;

use common::{context, float, iota, scaled_sum, TestBackend};
use fuser_rs::cache::CACHE_FORMAT_VERSION;
use fuser_rs::{
    DType, ExecuteOptions, FusionConfig, FusionError, InputDecl, RestorePolicy, Trace,
};

fn lazy_config() -> FusionConfig {
    FusionConfig {
        restore_policy: RestorePolicy::Lazy,
        ..FusionConfig::default()
    }
}

#[test]
fn portable_artifacts_survive_a_round_trip_without_recompiling() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fusion.cache");
    let ctx = context(TestBackend::new("cpu-persist"));
    let trace = scaled_sum(2, 3.0, false)?;
    let inputs = [iota(&[2, 3]), float(&[2, 3], vec![1.0; 6])];
    let before = ctx.execute(&trace, &inputs, &ExecuteOptions::default())?;

    ctx.serialize(&path)?;
    ctx.cache().reset();
    assert_eq!(ctx.cache().num_entries(), 0);
    ctx.deserialize(&path)?;
    assert_eq!(ctx.backend().restores(), 1);
    assert_eq!(ctx.cache().fingerprints(), vec![trace.fingerprint()]);

    let after = ctx.execute(&trace, &inputs, &ExecuteOptions::default())?;
    assert_eq!(before[0].to_vec(), after[0].to_vec());
    assert_eq!(ctx.backend().compiles(), 1);

    let restored_trace = ctx
        .cache()
        .trace(trace.fingerprint())
        .expect("trace persisted with its entry");
    assert!(restored_trace.structurally_eq(&trace));
    assert_eq!(restored_trace.to_string(), trace.to_string());
    Ok(())
}

#[test]
fn lazy_restore_defers_rebuilding_until_first_use() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fusion.cache");
    let trace = Trace::define(|rec| {
        let x = rec.declare_input(InputDecl::symbolic(1, DType::Float))?;
        let y = rec.sigmoid(x)?;
        rec.declare_output(y, None)
    })?;
    let input = float(&[3], vec![-1.0, 0.0, 1.0]);

    let writer = context(TestBackend::new("cpu-lazy"));
    let expected = writer.execute(&trace, &[input.clone()], &ExecuteOptions::default())?;
    writer.serialize(&path)?;

    // A second context with its own backend and cache stands in for a new process.
    let reader = context(TestBackend::new("cpu-lazy")).with_config(lazy_config());
    reader.deserialize(&path)?;
    assert_eq!(reader.cache().num_entries(), 1);
    assert_eq!(reader.backend().restores(), 0);

    let out = reader.execute(&trace, &[input], &ExecuteOptions::default())?;
    assert_eq!(out[0].to_vec(), expected[0].to_vec());
    assert_eq!(reader.backend().restores(), 1);
    assert_eq!(reader.backend().compiles(), 0);
    Ok(())
}

#[test]
fn non_portable_artifacts_recompile_once_after_loading() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fusion.cache");
    let ctx = context(TestBackend::new("cpu-recompile").non_portable());
    let trace = scaled_sum(1, 0.5, true)?;
    let inputs = [float(&[4], vec![1.0, 2.0, 3.0, 4.0]), float(&[4], vec![1.0; 4])];
    let before = ctx.execute(&trace, &inputs, &ExecuteOptions::default())?;

    ctx.serialize(&path)?;
    ctx.cache().reset();
    ctx.deserialize(&path)?;
    assert_eq!(ctx.cache().num_specializations(trace.fingerprint()), 1);

    // Persisted specializations are rebuilt even when compile-on-miss is off.
    let strict = ExecuteOptions {
        compile_on_miss: Some(false),
        ..ExecuteOptions::default()
    };
    let after = ctx.execute(&trace, &inputs, &strict)?;
    assert_eq!(before[0].to_vec(), after[0].to_vec());
    assert_eq!(ctx.backend().compiles(), 2);

    ctx.execute(&trace, &inputs, &ExecuteOptions::default())?;
    assert_eq!(ctx.backend().compiles(), 2);
    assert_eq!(ctx.backend().restores(), 0);
    Ok(())
}

#[test]
fn damaged_files_leave_the_cache_untouched() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fusion.cache");
    let ctx = context(TestBackend::new("cpu-damaged"));
    let first = scaled_sum(1, 2.0, false)?;
    let second = scaled_sum(1, 4.0, false)?;
    let inputs = [iota(&[3]), iota(&[3])];
    ctx.execute(&first, &inputs, &ExecuteOptions::default())?;
    ctx.serialize(&path)?;
    ctx.execute(&second, &inputs, &ExecuteOptions::default())?;
    let fingerprints = ctx.cache().fingerprints();
    assert_eq!(fingerprints.len(), 2);

    let good = fs::read(&path)?;
    let mut flipped = good.clone();
    let middle = flipped.len() / 2;
    flipped[middle] ^= 0xff;
    let mut future = good.clone();
    future[8..12].copy_from_slice(&(CACHE_FORMAT_VERSION + 1).to_le_bytes());
    let damaged = [
        ("truncated", good[..good.len() - 7].to_vec()),
        ("flipped", flipped),
        ("future version", future),
        ("not a cache", b"hello".to_vec()),
    ];

    for (label, bytes) in damaged {
        let broken = dir.path().join(label.replace(' ', "_"));
        fs::write(&broken, bytes)?;
        let err = ctx
            .deserialize(&broken)
            .expect_err("damaged cache files must be rejected");
        assert!(
            matches!(err, FusionError::Deserialization { .. }),
            "{label}: unexpected error {err}"
        );
        assert_eq!(ctx.cache().fingerprints(), fingerprints, "{label}");
    }
    let missing = ctx
        .deserialize(dir.path().join("absent.cache"))
        .expect_err("missing file");
    assert!(matches!(missing, FusionError::Deserialization { .. }));

    ctx.execute(&second, &inputs, &ExecuteOptions::default())?;
    assert_eq!(ctx.backend().compiles(), 2);
    Ok(())
}

#[test]
fn caches_are_bound_to_the_backend_that_wrote_them() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fusion.cache");
    let writer = context(TestBackend::new("cpu-writer"));
    let trace = scaled_sum(1, 2.0, false)?;
    writer.execute(&trace, &[iota(&[2]), iota(&[2])], &ExecuteOptions::default())?;
    writer.serialize(&path)?;

    let reader = context(TestBackend::new("cpu-reader"));
    let err = reader
        .deserialize(&path)
        .expect_err("backend name differs");
    assert!(err.to_string().contains("cpu-writer"));
    assert_eq!(reader.cache().num_entries(), 0);
    Ok(())
}

#[test]
fn serializing_to_an_unwritable_path_fails_cleanly() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context(TestBackend::new("cpu-unwritable"));
    let trace = scaled_sum(1, 2.0, false)?;
    ctx.execute(&trace, &[iota(&[2]), iota(&[2])], &ExecuteOptions::default())?;

    let err = ctx
        .serialize(dir.path().join("missing").join("fusion.cache"))
        .expect_err("parent directory does not exist");
    assert!(matches!(err, FusionError::Serialization { .. }));
    assert_eq!(ctx.cache().num_entries(), 1);
    Ok(())
}

#[test]
fn recompiled_specializations_are_keyed_by_the_request() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fusion.cache");
    let ctx = context(TestBackend::new("cpu-rekey").non_portable());
    let trace = scaled_sum(2, 1.0, false)?;
    let transposed = || iota(&[3, 2]).as_strided(&[2, 3], &[1, 2], 0);
    let strided = [transposed()?, transposed()?];
    let dense = [float(&[2, 3], vec![0.0, 2.0, 4.0, 1.0, 3.0, 5.0]), iota(&[2, 3])];
    ctx.execute(&trace, &strided, &ExecuteOptions::default())?;

    ctx.serialize(&path)?;
    ctx.cache().reset();
    ctx.deserialize(&path)?;

    // The persisted strided key also serves dense inputs, but the artifact compiled from them
    // is stored under the dense key and leaves the strided placeholder in place.
    let out = ctx.execute(&trace, &dense, &ExecuteOptions::default())?;
    assert_eq!(out[0].to_vec(), vec![0.0, 3.0, 6.0, 4.0, 7.0, 10.0]);
    assert_eq!(ctx.backend().compiles(), 2);
    assert_eq!(ctx.cache().num_specializations(trace.fingerprint()), 2);

    let out = ctx.execute(&trace, &strided, &ExecuteOptions::default())?;
    assert_eq!(out[0].to_vec(), vec![0.0, 4.0, 8.0, 2.0, 6.0, 10.0]);
    assert_eq!(ctx.backend().compiles(), 3);
    assert_eq!(ctx.cache().num_specializations(trace.fingerprint()), 2);

    ctx.execute(&trace, &strided, &ExecuteOptions::default())?;
    ctx.execute(&trace, &dense, &ExecuteOptions::default())?;
    assert_eq!(ctx.backend().compiles(), 3);
    Ok(())
}

#[test]
fn rejected_eager_loads_do_not_count_restores() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fusion.cache");
    let writer = context(TestBackend::new("cpu-restore-count"));
    let inputs = [iota(&[2]), iota(&[2])];
    writer.execute(&scaled_sum(1, 2.0, false)?, &inputs, &ExecuteOptions::default())?;
    writer.execute(&scaled_sum(1, 3.0, false)?, &inputs, &ExecuteOptions::default())?;
    writer.serialize(&path)?;

    let reader = context(TestBackend::new("cpu-restore-count"));
    reader.backend().fail_restores_after(1);
    let err = reader
        .deserialize(&path)
        .expect_err("second restore fails");
    assert!(matches!(err, FusionError::Deserialization { .. }));
    assert_eq!(reader.cache().num_entries(), 0);
    assert_eq!(reader.cache().stats().restores, 0);

    let healthy = context(TestBackend::new("cpu-restore-count"));
    healthy.deserialize(&path)?;
    assert_eq!(healthy.cache().stats().restores, 2);
    Ok(())
}

#[test]
fn failed_lazy_restore_falls_back_to_compiling() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fusion.cache");
    let trace = scaled_sum(1, 2.0, false)?;
    let inputs = [iota(&[3]), float(&[3], vec![1.0; 3])];

    let writer = context(TestBackend::new("cpu-stale"));
    let expected = writer.execute(&trace, &inputs, &ExecuteOptions::default())?;
    writer.serialize(&path)?;

    let reader = context(TestBackend::new("cpu-stale")).with_config(lazy_config());
    reader.backend().fail_restores_after(0);
    reader.deserialize(&path)?;

    let out = reader.execute(&trace, &inputs, &ExecuteOptions::default())?;
    assert_eq!(out[0].to_vec(), expected[0].to_vec());
    assert_eq!(reader.backend().restores(), 0);
    assert_eq!(reader.backend().compiles(), 1);
    assert_eq!(reader.cache().num_specializations(trace.fingerprint()), 1);

    // The stale bytes are not retried.
    reader.execute(&trace, &inputs, &ExecuteOptions::default())?;
    assert_eq!(reader.backend().compiles(), 1);
    let stats = reader.cache().stats();
    assert_eq!((stats.restores, stats.compilations, stats.hits), (0, 1, 1));
    Ok(())
}
