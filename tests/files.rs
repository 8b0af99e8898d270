//! Module images and configuration read from disk.

use std::sync::Arc;

use cadence::vm::{DataType, Engine, FunctionBuilder};
use cadence::{EngineConfig, ExecutionOutcome, ImageError, ModuleImage};
use parking_lot::Mutex;
use tempfile::TempDir;

const LIB: &str = r#"{
    "name": "lib",
    "globals": [{ "name": "base", "type": "int" }],
    "initializer": { "name": "$init", "code": [{ "SetG4": [0, 100] }, { "Ret": 0 }] },
    "functions": [
        { "name": "add_base", "returns": "int", "params": ["int"], "locals": 1,
          "code": [
              { "CpyGtoV4": [1, 0] },
              { "AddI": [1, 1, 0] },
              { "CpyVtoR4": 1 },
              { "Ret": 1 }
          ] }
    ]
}"#;

const APP: &str = r#"{
    "name": "app",
    "system_functions": ["record"],
    "imports": [{ "name": "add_base", "from": "lib", "returns": "int", "params": ["int"] }],
    "functions": [
        { "name": "main", "returns": "int", "locals": 1,
          "code": [
              { "PshC4": 5 },
              { "CallBnd": 0 },
              { "CpyRtoV4": 1 },
              { "PshV4": 1 },
              { "CallSys": 0 },
              { "CpyVtoR4": 1 },
              { "Ret": 0 }
          ],
          "lines": [[0, 1], [4, 2], [5, 3]] }
    ]
}"#;

fn save(dir: &TempDir, name: &str, json: &str) -> std::path::PathBuf {
    let path = dir.path().join(format!("{name}.json"));
    ModuleImage::from_json(json).unwrap().save(&path).unwrap();
    path
}

#[test]
fn saved_images_load_and_link() {
    let dir = TempDir::new().unwrap();
    let lib_path = save(&dir, "lib", LIB);
    let app_path = save(&dir, "app", APP);
    assert_eq!(
        ModuleImage::load(&app_path).unwrap(),
        ModuleImage::from_json(APP).unwrap()
    );

    let engine = Engine::new(EngineConfig::default());
    let recorded = Arc::new(Mutex::new(Vec::new()));
    {
        let recorded = Arc::clone(&recorded);
        engine.register_function(
            FunctionBuilder::system("record").param(DataType::INT).build(),
            move |call| {
                recorded.lock().push(call.arg_int(0));
                Ok(())
            },
        );
    }

    let lib = ModuleImage::load(&lib_path).unwrap().build(&engine).unwrap();
    engine.reset_globals(&lib).unwrap();
    let app = ModuleImage::load(&app_path).unwrap().build(&engine).unwrap();
    engine.bind_all_imported_functions(&app).unwrap();

    let main = app.function_by_name("main").unwrap().id;
    let mut ctx = engine.create_context();
    ctx.prepare(main).unwrap();
    assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Finished));
    assert_eq!(ctx.return_dword(), 105);
    assert_eq!(recorded.lock().as_slice(), &[105]);
}

#[test]
fn image_errors_are_reported() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        ModuleImage::load(dir.path().join("missing.json")),
        Err(ImageError::Io(_))
    ));

    let broken = dir.path().join("broken.json");
    std::fs::write(&broken, "{ \"name\": ").unwrap();
    assert!(matches!(ModuleImage::load(&broken), Err(ImageError::Json(_))));

    // `record` is not registered with this engine.
    let engine = Engine::new(EngineConfig::default());
    let app = ModuleImage::load(save(&dir, "app", APP)).unwrap();
    assert!(matches!(
        app.build(&engine),
        Err(ImageError::UnknownSystemFunction(name)) if name == "record"
    ));
}

#[test]
fn config_file_overrides_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cadence.toml");
    std::fs::write(
        &path,
        "initial_context_stack_words = 128\nmax_context_stack_words = 4096\n",
    )
    .unwrap();

    let config = EngineConfig::load(&path).unwrap();
    assert_eq!(config.initial_context_stack_words, 128);
    assert_eq!(config.max_context_stack_words, 4096);
    assert!(config.verify_bytecode);

    std::fs::write(&path, "stack = 1\n").unwrap();
    assert!(EngineConfig::load(&path).is_err());
}
