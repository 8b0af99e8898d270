//! End-to-end execution: faults and their locations, object cleanup and
//! stack growth.

use std::sync::Arc;

use cadence::vm::{
    DataType, Engine, FunctionBuilder, FunctionId, ObjectType, Op, RuntimeFault, TypeId,
};
use cadence::{ContextState, EngineConfig, ExecutionOutcome};
use parking_lot::Mutex;

fn engine() -> Arc<Engine> {
    Engine::new(EngineConfig::default())
}

/// `int depth(int n)`: recurses `n` times and returns `n`.
fn build_depth(engine: &Arc<Engine>) -> FunctionId {
    let mut b = engine.module_builder("depth");
    let depth = b.declare("depth");
    b.define(
        depth,
        FunctionBuilder::script("depth")
            .param(DataType::INT)
            .returns(DataType::INT)
            .locals(1)
            .code(vec![
                Op::CmpIi(0, 0),
                Op::Jnz(2),
                Op::CpyVtoR4(0),
                Op::Ret(1),
                Op::AddIi(1, 0, -1),
                Op::PshV4(1),
                Op::Call(depth),
                Op::CpyRtoV4(1),
                Op::IncVi(1),
                Op::CpyVtoR4(1),
                Op::Ret(1),
            ])
            .line(0, 1)
            .line(4, 2)
            .build(),
    );
    b.build().unwrap();
    depth
}

#[test]
fn divide_by_zero_reports_function_and_line() {
    let engine = engine();
    let mut b = engine.module_builder("m");
    let f = b.function(
        FunctionBuilder::script("ratio")
            .returns(DataType::INT)
            .locals(2)
            .code(vec![
                Op::SetV4(1, 10),
                Op::SetV4(2, 0),
                Op::DivI(1, 1, 2),
                Op::CpyVtoR4(1),
                Op::Ret(0),
            ])
            .line(0, 1)
            .line(1, 2)
            .line(2, 3)
            .line(3, 4)
            .build(),
    );
    b.build().unwrap();

    let mut ctx = engine.create_context();
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Exception));
    assert_eq!(ctx.state(), ContextState::Exception);
    assert_eq!(ctx.exception_string(), Some("Divide by zero"));
    assert_eq!(ctx.exception_line(), Some(3));
    assert_eq!(ctx.exception_function(), Some(f));
    let info = ctx.exception_info().unwrap();
    assert_eq!(info.fault, RuntimeFault::DivideByZero);
    assert_eq!(info.function_name, "ratio");
}

#[test]
fn nested_null_access_keeps_call_stack_until_cleanup() {
    let engine = engine();
    let mut b = engine.module_builder("m");
    let h = b.function(
        FunctionBuilder::script("h")
            .locals(2)
            .code(vec![Op::SetV8(2, 0), Op::ChkNullV(2), Op::Ret(0)])
            .line(0, 20)
            .line(1, 21)
            .build(),
    );
    let g = b.function(
        FunctionBuilder::script("g")
            .code(vec![Op::Call(h), Op::Ret(0)])
            .line(0, 10)
            .build(),
    );
    let f = b.function(
        FunctionBuilder::script("f")
            .code(vec![Op::Call(g), Op::Ret(0)])
            .line(0, 5)
            .build(),
    );
    b.build().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut ctx = engine.create_context();
    {
        let seen = Arc::clone(&seen);
        ctx.set_exception_callback(move |ctx| {
            seen.lock().push((
                ctx.call_stack_size(),
                ctx.current_function().map(|f| f.name.clone()),
                ctx.exception_line(),
            ));
        });
    }
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Exception));
    assert_eq!(ctx.exception_string(), Some("Null pointer access"));
    assert_eq!(ctx.exception_function(), Some(h));
    assert_eq!(ctx.exception_line(), Some(21));

    assert_eq!(ctx.call_stack_size(), 2);
    assert_eq!(ctx.call_stack_function(0).unwrap().name, "f");
    assert_eq!(ctx.call_stack_function(1).unwrap().name, "g");
    assert_eq!(ctx.call_stack_line(0), Some(5));
    assert_eq!(ctx.call_stack_line(1), Some(10));
    assert_eq!(
        seen.lock().as_slice(),
        &[(2, Some("h".to_string()), Some(21))]
    );

    ctx.unprepare().unwrap();
    assert_eq!(ctx.call_stack_size(), 0);
    assert_eq!(ctx.state(), ContextState::Uninitialized);
}

#[test]
fn object_handles_balance_references() {
    let engine = engine();
    let ty = engine
        .register_object_type(ObjectType::new("Node").ref_counted().fields(1))
        .unwrap();
    let mut b = engine.module_builder("m");
    let f = b.function(
        FunctionBuilder::script("f")
            .locals(4)
            .object_variable(2, ty)
            .object_variable(4, ty)
            .code(vec![
                Op::Psf(2),
                Op::Alloc(ty, FunctionId::NONE),
                Op::PshV8(2),
                Op::Psf(4),
                Op::RefCpy(ty),
                Op::Pop(2),
                Op::Psf(4),
                Op::Free(ty),
                Op::Psf(2),
                Op::Free(ty),
                Op::Ret(0),
            ])
            .build(),
    );
    b.build().unwrap();

    let mut ctx = engine.create_context();
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Finished));
    let stats = engine.heap().stats();
    assert_eq!(stats.allocations, 1);
    assert_eq!(stats.frees, 1);
    assert_eq!(stats.add_refs, 1);
    assert_eq!(stats.releases, 2);
    assert_eq!(engine.heap().live_count(), 0);
}

#[test]
fn exception_releases_object_variables_on_cleanup() {
    let engine = engine();
    let ty = engine
        .register_object_type(ObjectType::new("Node").ref_counted())
        .unwrap();
    let mut b = engine.module_builder("m");
    let f = b.function(
        FunctionBuilder::script("f")
            .locals(4)
            .object_variable(2, ty)
            .code(vec![
                Op::Psf(2),
                Op::Alloc(ty, FunctionId::NONE),
                Op::SetV4(3, 1),
                Op::SetV4(4, 0),
                Op::DivI(3, 3, 4),
                Op::Ret(0),
            ])
            .build(),
    );
    b.build().unwrap();

    let mut ctx = engine.create_context();
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Exception));
    assert_eq!(engine.heap().live_count(), 1);

    ctx.unprepare().unwrap();
    assert_eq!(engine.heap().live_count(), 0);
}

/// `f` owns `a` and passes a handle to it into `g`; `g` owns `b` and calls
/// `h`, which faults on a null handle.
fn build_owner_chain(engine: &Arc<Engine>, ty: TypeId, keep_args: bool) -> FunctionId {
    let mut b = engine.module_builder("chain");
    let h = b.function(
        FunctionBuilder::script("h")
            .locals(2)
            .code(vec![Op::SetV8(2, 0), Op::ChkNullV(2), Op::Ret(0)])
            .line(1, 30)
            .build(),
    );
    let mut g = FunctionBuilder::script("g")
        .param(DataType::handle(ty))
        .locals(2)
        .object_variable(2, ty)
        .code(vec![
            Op::Psf(2),
            Op::Alloc(ty, FunctionId::NONE),
            Op::Call(h),
            Op::Ret(2),
        ])
        .line(2, 20);
    if keep_args {
        g = g.dont_clean_up_on_exception();
    }
    let g = b.function(g.build());
    let f = b.function(
        FunctionBuilder::script("f")
            .locals(4)
            .object_variable(2, ty)
            .object_variable(4, ty)
            .code(vec![
                Op::Psf(2),
                Op::Alloc(ty, FunctionId::NONE),
                // Copy the handle into 4, then move it into the argument.
                Op::PshV8(2),
                Op::Psf(4),
                Op::RefCpy(ty),
                Op::Pop(2),
                Op::PshV8(4),
                Op::SetV8(4, 0),
                Op::Call(g),
                Op::Ret(0),
            ])
            .line(8, 10)
            .build(),
    );
    b.build().unwrap();
    f
}

#[test]
fn cleanup_releases_objects_of_every_frame_once() {
    let engine = engine();
    let ty = engine
        .register_object_type(ObjectType::new("Node").ref_counted())
        .unwrap();
    let f = build_owner_chain(&engine, ty, false);

    let mut ctx = engine.create_context();
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Exception));
    assert_eq!(ctx.exception_line(), Some(30));
    assert_eq!(ctx.call_stack_size(), 2);
    assert_eq!(ctx.call_stack_line(0), Some(10));
    assert_eq!(ctx.call_stack_line(1), Some(20));
    assert_eq!(engine.heap().live_count(), 2);

    ctx.unprepare().unwrap();
    assert_eq!(engine.heap().live_count(), 0);
    let stats = engine.heap().stats();
    assert_eq!(stats.allocations, 2);
    assert_eq!(stats.frees, 2);
    assert_eq!(stats.add_refs, 1);
    assert_eq!(stats.releases, 3);
}

#[test]
fn cleanup_skips_arguments_of_functions_that_keep_them() {
    let engine = engine();
    let ty = engine
        .register_object_type(ObjectType::new("Node").ref_counted())
        .unwrap();
    let f = build_owner_chain(&engine, ty, true);

    let mut ctx = engine.create_context();
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Exception));
    assert_eq!(engine.heap().live_count(), 2);

    // Locals of `g` are still freed; the handle argument is not released.
    ctx.unprepare().unwrap();
    assert_eq!(engine.heap().live_count(), 1);
    let stats = engine.heap().stats();
    assert_eq!(stats.frees, 1);
    assert_eq!(stats.add_refs, 1);
    assert_eq!(stats.releases, 2);
}

#[test]
fn deep_recursion_grows_the_stack() {
    let engine = Engine::new(EngineConfig {
        initial_context_stack_words: 64,
        ..EngineConfig::default()
    });
    let depth = build_depth(&engine);

    let mut ctx = engine.create_context();
    ctx.prepare(depth).unwrap();
    ctx.set_arg_dword(0, 500).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Finished));
    assert_eq!(ctx.return_dword(), 500);
    assert!(ctx.stack_words() > 64);

    // Extra blocks are dropped when the context is prepared again.
    ctx.prepare(depth).unwrap();
    assert_eq!(ctx.stack_words(), 64);
    ctx.set_arg_dword(0, 3).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Finished));
    assert_eq!(ctx.return_dword(), 3);
}

#[test]
fn stack_ceiling_raises_overflow_in_caller() {
    let engine = Engine::new(EngineConfig {
        initial_context_stack_words: 64,
        max_context_stack_words: 256,
        ..EngineConfig::default()
    });
    let depth = build_depth(&engine);

    let mut ctx = engine.create_context();
    ctx.prepare(depth).unwrap();
    ctx.set_arg_dword(0, 100_000).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Exception));
    assert_eq!(ctx.exception_info().unwrap().fault, RuntimeFault::StackOverflow);
    assert_eq!(ctx.exception_function(), Some(depth));
    assert_eq!(ctx.exception_line(), Some(2));
    assert!(ctx.call_stack_size() > 0);
    assert!(ctx.stack_words() <= 256);

    // The context is reusable after the fault.
    ctx.prepare(depth).unwrap();
    ctx.set_arg_dword(0, 10).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Finished));
    assert_eq!(ctx.return_dword(), 10);
}

#[test]
fn many_contexts_share_one_engine() {
    let engine = engine();
    let depth = build_depth(&engine);

    let handles: Vec<_> = (0..4u32)
        .map(|i| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let mut ctx = engine.create_context();
                ctx.prepare(depth).unwrap();
                ctx.set_arg_dword(0, 50 + i).unwrap();
                assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Finished));
                ctx.return_dword()
            })
        })
        .collect();
    let results: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results, vec![50, 51, 52, 53]);
}
