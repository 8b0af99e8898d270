//! Calls across modules, through virtual and interface slots, and into host
//! functions.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use cadence::vm::{
    DataType, Engine, FunctionBuilder, FunctionId, Module, ObjectType, Op, RuntimeFault, TypeId,
};
use cadence::{ContextError, EngineConfig, ExecutionOutcome};

fn engine() -> Arc<Engine> {
    Engine::new(EngineConfig::default())
}

/// Module `lib` exporting `int triple(int)`.
fn build_lib(engine: &Arc<Engine>) -> Arc<Module> {
    let mut b = engine.module_builder("lib");
    b.function(
        FunctionBuilder::script("triple")
            .param(DataType::INT)
            .returns(DataType::INT)
            .locals(1)
            .code(vec![Op::MulIi(1, 0, 3), Op::CpyVtoR4(1), Op::Ret(1)])
            .build(),
    );
    b.build().unwrap()
}

/// Module `app` whose `run` calls the imported `triple(5)`.
fn build_app(engine: &Arc<Engine>) -> (Arc<Module>, FunctionId) {
    let mut b = engine.module_builder("app");
    let triple = b.import(
        FunctionBuilder::import("triple", "lib")
            .param(DataType::INT)
            .returns(DataType::INT)
            .build(),
    );
    let run = b.function(
        FunctionBuilder::script("run")
            .returns(DataType::INT)
            .code(vec![Op::PshC4(5), Op::CallBnd(triple), Op::Ret(0)])
            .line(0, 3)
            .build(),
    );
    (b.build().unwrap(), run)
}

#[test]
fn unbound_import_faults_until_bound() {
    let engine = engine();
    let lib = build_lib(&engine);
    let (app, run) = build_app(&engine);

    let mut ctx = engine.create_context();
    ctx.prepare(run).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Exception));
    assert_eq!(ctx.exception_info().unwrap().fault, RuntimeFault::UnboundFunction);
    assert_eq!(ctx.exception_string(), Some("Unbound function called"));
    assert_eq!(ctx.exception_line(), Some(3));

    let declaration = Arc::clone(&app.import(0).unwrap().declaration);
    assert_eq!(
        ctx.prepare_function(Arc::clone(&declaration)),
        Err(ContextError::UnboundFunction(declaration.id.0))
    );

    engine.bind_all_imported_functions(&app).unwrap();
    ctx.prepare(run).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Finished));
    assert_eq!(ctx.return_dword(), 15);
    assert_eq!(app.context_refs(), 1);
    assert_eq!(lib.context_refs(), 0);

    // Preparing the import itself runs the bound target.
    ctx.prepare_function(declaration).unwrap();
    assert_eq!(lib.context_refs(), 1);
    assert_eq!(app.context_refs(), 0);
    ctx.set_arg_dword(0, 7).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Finished));
    assert_eq!(ctx.return_dword(), 21);
}

#[test]
fn discarded_module_lives_while_referenced() {
    let engine = engine();
    let lib = build_lib(&engine);
    let (app, _) = build_app(&engine);
    engine.bind_all_imported_functions(&app).unwrap();
    let triple = lib.function_by_name("triple").unwrap().id;

    let mut ctx = engine.create_context();
    ctx.prepare(triple).unwrap();
    engine.discard_module("lib").unwrap();
    assert!(engine.module("lib").is_none());
    assert!(engine.function(triple).is_some());

    ctx.set_arg_dword(0, 2).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Finished));
    assert_eq!(ctx.return_dword(), 6);
    drop(ctx);
    assert_eq!(lib.context_refs(), 0);

    // Still bound from `app`.
    assert_eq!(engine.collect_discarded_modules(), 0);
    engine.unbind_all_imported_functions(&app);
    assert_eq!(engine.collect_discarded_modules(), 1);
    assert!(engine.function(triple).is_none());
}

struct Zoo {
    animal: TypeId,
    dog: TypeId,
    cat: TypeId,
    /// `int call_virtual(Animal@)`
    call_virtual: FunctionId,
    /// `int call_interface(Animal@)`
    call_interface: FunctionId,
}

fn build_zoo(engine: &Arc<Engine>) -> Zoo {
    const SPEAK: u32 = 1;
    let mut b = engine.module_builder("zoo");
    let dog_speak = b.declare("Dog::speak");
    let cat_speak = b.declare("Cat::speak");

    let animal = engine
        .register_object_type(ObjectType::new("Animal").script_object())
        .unwrap();
    let dog = engine
        .register_object_type(
            ObjectType::new("Dog")
                .script_object()
                .method(dog_speak)
                .virtual_method(dog_speak),
        )
        .unwrap();
    let cat = engine
        .register_object_type(
            ObjectType::new("Cat")
                .script_object()
                .method(cat_speak)
                .virtual_method(cat_speak),
        )
        .unwrap();

    for (id, ty, sound) in [(dog_speak, dog, 1u32), (cat_speak, cat, 2)] {
        b.define(
            id,
            FunctionBuilder::script("speak")
                .method_of(ty)
                .signature_id(SPEAK)
                .returns(DataType::INT)
                .locals(1)
                .code(vec![Op::SetV4(1, sound), Op::CpyVtoR4(1), Op::Ret(2)])
                .build(),
        );
    }

    let slot = b.function(
        FunctionBuilder::virtual_slot("speak", animal, 0)
            .signature_id(SPEAK)
            .returns(DataType::INT)
            .build(),
    );
    let intf = b.function(
        FunctionBuilder::interface("speak", animal, SPEAK)
            .returns(DataType::INT)
            .build(),
    );

    // The caller owns its handle argument and releases it before returning.
    let caller = |name: &str, target: FunctionId| {
        FunctionBuilder::script(name)
            .param(DataType::handle(animal))
            .returns(DataType::INT)
            .code(vec![
                Op::PshV8(0),
                Op::CallIntf(target),
                Op::Psf(0),
                Op::Free(animal),
                Op::Ret(2),
            ])
            .build()
    };
    let call_virtual = b.function(caller("call_virtual", slot));
    let call_interface = b.function(caller("call_interface", intf));
    b.build().unwrap();

    Zoo {
        animal,
        dog,
        cat,
        call_virtual,
        call_interface,
    }
}

#[test]
fn virtual_and_interface_calls_dispatch_on_object_type() {
    let engine = engine();
    let zoo = build_zoo(&engine);
    let dog = engine.heap().alloc(&engine.object_type(zoo.dog).unwrap());
    let cat = engine.heap().alloc(&engine.object_type(zoo.cat).unwrap());

    let mut ctx = engine.create_context();
    for (caller, object, expected) in [
        (zoo.call_virtual, dog, 1),
        (zoo.call_virtual, cat, 2),
        (zoo.call_interface, dog, 1),
        (zoo.call_interface, cat, 2),
    ] {
        ctx.prepare(caller).unwrap();
        ctx.set_arg_object(0, Some(object)).unwrap();
        assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Finished));
        assert_eq!(ctx.return_dword(), expected);
        assert_eq!(engine.heap().get(object).unwrap().ref_count(), 1);
    }
    drop(ctx);

    let mut heap = engine.heap();
    heap.release(dog);
    heap.release(cat);
    assert_eq!(heap.live_count(), 0);
}

#[test]
fn dispatch_on_null_handle_faults() {
    let engine = engine();
    let zoo = build_zoo(&engine);
    let mut ctx = engine.create_context();
    ctx.prepare(zoo.call_virtual).unwrap();
    ctx.set_arg_object(0, None).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Exception));
    assert_eq!(ctx.exception_info().unwrap().fault, RuntimeFault::NullPointerAccess);
    assert_eq!(ctx.exception_function(), Some(zoo.call_virtual));
}

#[test]
fn method_entry_point_uses_object_set_by_host() {
    let engine = engine();
    let zoo = build_zoo(&engine);
    let speak = engine
        .module("zoo")
        .unwrap()
        .functions()
        .find(|f| f.object_type == Some(zoo.cat))
        .map(|f| f.id)
        .unwrap();
    let cat = engine.heap().alloc(&engine.object_type(zoo.cat).unwrap());

    let mut ctx = engine.create_context();
    ctx.prepare(speak).unwrap();
    ctx.set_object(Some(cat)).unwrap();
    assert_eq!(engine.heap().get(cat).unwrap().ref_count(), 2);
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Finished));
    assert_eq!(ctx.return_dword(), 2);

    // `this` is released by cleanup, not by the method.
    ctx.unprepare().unwrap();
    assert_eq!(engine.heap().get(cat).unwrap().ref_count(), 1);
    assert!(engine.object_type(zoo.animal).is_some());
}

#[test]
fn host_function_receives_arguments_and_returns() {
    let engine = engine();
    let hypot = engine.register_function(
        FunctionBuilder::system("hypot")
            .param(DataType::DOUBLE)
            .param(DataType::DOUBLE)
            .returns(DataType::DOUBLE)
            .build(),
        |call| {
            let (a, b) = (call.arg_double(0), call.arg_double(1));
            call.set_return_double((a * a + b * b).sqrt());
            Ok(())
        },
    );
    let mut b = engine.module_builder("m");
    let f = b.function(
        FunctionBuilder::script("f")
            .returns(DataType::DOUBLE)
            .code(vec![
                Op::PshC8(4.0f64.to_bits()),
                Op::PshC8(3.0f64.to_bits()),
                Op::CallSys(hypot),
                Op::Ret(0),
            ])
            .build(),
    );
    b.build().unwrap();

    let mut ctx = engine.create_context();
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Finished));
    assert_eq!(ctx.return_double(), 5.0);

    // System functions can be entry points too.
    ctx.prepare(hypot).unwrap();
    ctx.set_arg_double(0, 6.0).unwrap();
    ctx.set_arg_double(1, 8.0).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Finished));
    assert_eq!(ctx.return_double(), 10.0);
}

#[test]
fn host_exception_is_attributed_to_calling_script() {
    let engine = engine();
    let calls = Arc::new(AtomicU32::new(0));
    let check = {
        let calls = Arc::clone(&calls);
        engine.register_function(
            FunctionBuilder::system("check").param(DataType::INT).build(),
            move |call| {
                calls.fetch_add(1, Ordering::Relaxed);
                assert!(call.context().system_function().is_some());
                match call.arg_int(0) {
                    n if n < 0 => Err(format!("negative: {n}")),
                    0 => call.set_exception("zero").map_err(|e| e.to_string()),
                    _ => Ok(()),
                }
            },
        )
    };
    let mut b = engine.module_builder("m");
    let run = b.function(
        FunctionBuilder::script("run")
            .param(DataType::INT)
            .code(vec![Op::PshV4(0), Op::CallSys(check), Op::Ret(1)])
            .line(0, 7)
            .line(1, 8)
            .build(),
    );
    b.build().unwrap();

    let mut ctx = engine.create_context();
    for (arg, message) in [(-4i32, "negative: -4"), (0, "zero")] {
        ctx.prepare(run).unwrap();
        ctx.set_arg_dword(0, arg as u32).unwrap();
        assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Exception));
        let info = ctx.exception_info().unwrap();
        assert_eq!(info.fault, RuntimeFault::Host(message.to_string()));
        assert_eq!(info.message, message);
        assert_eq!(info.function, run);
        assert_eq!(info.line, 8);
        assert!(ctx.system_function().is_none());
    }

    ctx.prepare(run).unwrap();
    ctx.set_arg_dword(0, 3).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Finished));
    assert_eq!(calls.load(Ordering::Relaxed), 3);
}
