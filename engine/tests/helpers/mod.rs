//! Shared fixture tree for the pipeline tests.

use std::fs;
use std::path::Path;
use symscope_engine::{Engine, EngineConfig};
use tempfile::TempDir;

/// A small TypeScript workspace exercising every pipeline stage: an exact
/// class, a typo-fuzzy class, a referenced function, and an import chain.
pub fn fixture_workspace() -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = dir.path().join("src");
    fs::create_dir_all(&src).expect("mkdir src");

    write(&src.join("a.ts"), "export class TestClass {\n  run(): void {}\n}\n");
    write(
        &src.join("b.ts"),
        "import { TestClass } from './a';\n\nconst instance = new TestClass();\ninstance.run();\n",
    );
    write(
        &src.join("util.ts"),
        "export function TestFunction(): number {\n  return 1;\n}\nexport const sum = TestFunction() + TestFunction();\n",
    );
    write(&src.join("grep.ts"), "export class AsyncEnhancedGrep {\n  search(): void {}\n}\n");
    write(
        &src.join("use_grep.ts"),
        "import { AsyncEnhancedGrep } from './grep';\n\nnew AsyncEnhancedGrep();\n",
    );
    write(&src.join("server.ts"), "export class HTTPServer {\n  listen(): void {}\n}\n");
    write(
        &src.join("use_server.ts"),
        "import { HTTPServer } from './server';\n\nconst server = new HTTPServer();\nserver.listen();\n",
    );

    // Noise that must never surface in results
    let ignored = dir.path().join("node_modules/dep");
    fs::create_dir_all(&ignored).expect("mkdir node_modules");
    write(&ignored.join("a.ts"), "export class TestClass {}\n");

    dir
}

fn write(path: &Path, content: &str) {
    fs::write(path, content).expect("write fixture");
}

/// Engine over the fixture tree with warming disabled for determinism.
pub async fn engine_for(dir: &TempDir) -> Engine {
    let mut config = EngineConfig::default();
    config.workspace_root = dir.path().to_path_buf();
    config.cache.warm_identifiers = Vec::new();
    let engine = Engine::new(config);
    engine.initialize().await;
    engine
}

/// Engine with a modified config, warming still disabled.
pub async fn engine_with(dir: &TempDir, tweak: impl FnOnce(&mut EngineConfig)) -> Engine {
    let mut config = EngineConfig::default();
    config.workspace_root = dir.path().to_path_buf();
    config.cache.warm_identifiers = Vec::new();
    tweak(&mut config);
    let engine = Engine::new(config);
    engine.initialize().await;
    engine
}

/// The fixture file URI for `src/<name>`.
pub fn src_uri(dir: &TempDir, name: &str) -> symscope_core::FileUri {
    symscope_core::FileUri::from_path(&dir.path().join("src").join(name))
}
