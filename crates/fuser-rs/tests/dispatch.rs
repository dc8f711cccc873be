mod common;

use common::{context, float, iota, scaled_sum, TestBackend};
use fuser_rs::{
    AxisDecl, DType, DeviceClass, ExecuteOptions, FusionConfig, FusionContext, FusionError,
    InputDecl, Trace,
};
use fuser_rs_backend_ref_cpu::{CpuBackend, HostTensor};

#[test]
fn inputs_are_validated_against_declarations() -> anyhow::Result<()> {
    let ctx = context(TestBackend::new("cpu-validate"));
    let trace = scaled_sum(2, 1.0, false)?;
    let options = ExecuteOptions::default();

    let err = ctx
        .execute(&trace, &[iota(&[2, 2])], &options)
        .expect_err("one input short");
    assert!(matches!(err, FusionError::InputMismatch { index: 1, .. }));

    let err = ctx
        .execute(&trace, &[iota(&[2, 2]), iota(&[4])], &options)
        .expect_err("rank 1 where rank 2 is declared");
    assert!(matches!(err, FusionError::InputMismatch { index: 1, .. }));

    let doubles = HostTensor::ones(&[2, 2], DType::Double);
    let err = ctx
        .execute(&trace, &[doubles, iota(&[2, 2])], &options)
        .expect_err("dtype differs");
    match err {
        FusionError::InputMismatch {
            index,
            expected,
            actual,
        } => {
            assert_eq!(index, 0);
            assert!(expected.contains("Float"));
            assert!(actual.contains("Double"));
        }
        other => panic!("unexpected error {other}"),
    }

    let on_gpu = Trace::define(|rec| {
        let x = rec
            .declare_input(InputDecl::symbolic(1, DType::Float).with_device(DeviceClass::Cuda(0)))?;
        let y = rec.neg(x)?;
        rec.declare_output(y, None)
    })?;
    let err = ctx
        .execute(&on_gpu, &[iota(&[3])], &options)
        .expect_err("device class differs");
    assert!(err.to_string().contains("cuda:0"));
    assert_eq!(ctx.backend().compiles(), 0);
    Ok(())
}

#[test]
fn declared_broadcast_and_contiguity_are_enforced() -> anyhow::Result<()> {
    let ctx = context(TestBackend::new("cpu-concretize"));
    let bias = Trace::define(|rec| {
        let decl = InputDecl {
            axes: vec![AxisDecl::Broadcast, AxisDecl::Symbolic],
            contiguity: vec![None, Some(true)],
            dtype: DType::Float,
            device: DeviceClass::Cpu,
        };
        let x = rec.declare_input(decl)?;
        let y = rec.relu(x)?;
        rec.declare_output(y, None)
    })?;

    let out = ctx.execute(&bias, &[float(&[1, 3], vec![-1.0, 0.0, 2.0])], &ExecuteOptions::default())?;
    assert_eq!(out[0].to_vec(), vec![0.0, 0.0, 2.0]);

    let err = ctx
        .execute(&bias, &[iota(&[2, 3])], &ExecuteOptions::default())
        .expect_err("broadcast axis with extent 2");
    assert!(matches!(err, FusionError::ShapeConcretization { index: 0, .. }));

    let strided = iota(&[1, 6]).as_strided(&[1, 3], &[6, 2], 0)?;
    let err = ctx
        .execute(&bias, &[strided], &ExecuteOptions::default())
        .expect_err("declared contiguous axis has stride 2");
    assert!(matches!(err, FusionError::ShapeConcretization { .. }));
    assert_eq!(ctx.backend().compiles(), 1);
    Ok(())
}

#[test]
fn misaligned_inputs_surface_a_recoverable_execution_error() -> anyhow::Result<()> {
    let ctx = context(TestBackend::new("cpu-aligned").with_inner(CpuBackend::with_alignment(4)));
    let trace = scaled_sum(1, 1.0, false)?;
    let aligned = iota(&[4]);
    ctx.execute(&trace, &[aligned.clone(), aligned.clone()], &ExecuteOptions::default())?;

    let shifted = iota(&[8]).as_strided(&[4], &[1], 3)?;
    let err = ctx
        .execute(&trace, &[shifted, aligned], &ExecuteOptions::default())
        .expect_err("offset 3 is not a multiple of 4");
    match err {
        FusionError::Execution { source, .. } => assert!(source.recoverable),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(ctx.backend().compiles(), 1);
    Ok(())
}

#[test]
fn debug_output_is_captured_on_request() -> anyhow::Result<()> {
    let ctx = context(TestBackend::new("cpu-debug"));
    let trace = scaled_sum(1, 2.0, false)?;
    let inputs = [iota(&[2]), iota(&[2])];

    ctx.execute(&trace, &inputs, &ExecuteOptions::default())?;
    assert_eq!(ctx.last_debug_output(), None);

    ctx.execute(&trace, &inputs, &ExecuteOptions::default().with_debug_output())?;
    let text = ctx.last_debug_output().expect("capture requested");
    assert!(text.contains(&trace.fingerprint().to_string()));
    assert!(text.contains("mul("));

    ctx.execute(&trace, &inputs, &ExecuteOptions::default())?;
    assert_eq!(ctx.last_debug_output(), None);

    let always = context(TestBackend::new("cpu-debug-config")).with_config(FusionConfig {
        capture_debug_output: true,
        ..FusionConfig::default()
    });
    always.execute(&trace, &inputs, &ExecuteOptions::default())?;
    assert!(always.last_debug_output().is_some());
    Ok(())
}

#[test]
fn random_streams_depend_on_seed_and_execution_count() -> anyhow::Result<()> {
    let trace = Trace::define(|rec| {
        let like = rec.declare_input(InputDecl::symbolic(1, DType::Float))?;
        let low = rec.define_scalar(-1.0)?;
        let high = rec.define_scalar(1.0)?;
        let noise = rec.uniform(like, low, high, DType::Double)?;
        rec.declare_output(noise, None)
    })?;
    assert!(trace.has_stochastic_ops());
    assert!(!scaled_sum(1, 1.0, false)?.has_stochastic_ops());
    let like = [iota(&[16])];
    let seeded = ExecuteOptions::default().with_seed(7);
    let draw = |ctx: &FusionContext<TestBackend>, options: &ExecuteOptions| {
        ctx.execute(&trace, &like, options).map(|out| out[0].to_vec())
    };

    let first = context(TestBackend::new("cpu-rng-a"));
    let a0 = draw(&first, &seeded)?;
    let a1 = draw(&first, &seeded)?;
    assert_ne!(a0, a1);
    assert!(a0.iter().all(|v| (-1.0..1.0).contains(v)));

    let second = context(TestBackend::new("cpu-rng-b"));
    assert_eq!(draw(&second, &seeded)?, a0);
    assert_eq!(draw(&second, &seeded)?, a1);

    let third = context(TestBackend::new("cpu-rng-c"));
    assert_ne!(draw(&third, &ExecuteOptions::default().with_seed(8))?, a0);
    Ok(())
}
