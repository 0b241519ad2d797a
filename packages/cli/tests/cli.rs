use std::fs;

use tempfile::TempDir;
use wasi_farm_cli::{run, CliError, RunArgs};

/// Exits with the size of `/src/lib.rs` as reported by `path_filestat_get`.
const STAT_LIB: &str = r#"
(module
  (import "wasi_snapshot_preview1" "path_filestat_get"
    (func $stat (param i32 i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "src/lib.rs")
  (func (export "_start")
    (if (call $stat (i32.const 3) (i32.const 0) (i32.const 0) (i32.const 10) (i32.const 64))
      (then (call $proc_exit (i32.const 200))))
    ;; filestat.size lives at offset 32
    (call $proc_exit (i32.wrap_i64 (i64.load (i32.const 96))))))
"#;

fn workspace() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("project/src")).unwrap();
    fs::write(dir.path().join("project/src/lib.rs"), "pub fn f() {}\n").unwrap();
    fs::write(dir.path().join("stat.wat"), STAT_LIB).unwrap();
    dir
}

fn args(dir: &TempDir) -> RunArgs {
    RunArgs {
        module: dir.path().join("stat.wat"),
        preload: Some(dir.path().join("project")),
        args: Vec::new(),
        env: Vec::new(),
        config: None,
    }
}

#[test]
fn test_preloaded_files_are_visible() {
    let dir = workspace();
    assert_eq!(run(&args(&dir)).unwrap(), 14);
}

#[test]
fn test_without_preload_the_file_is_missing() {
    let dir = workspace();
    let args = RunArgs {
        preload: None,
        ..args(&dir)
    };
    assert_eq!(run(&args).unwrap(), 200);
}

#[test]
fn test_config_file_is_applied() {
    let dir = workspace();
    let config = dir.path().join("farm.json");
    fs::write(&config, r#"{"park": {"max_fds": 16}, "farm": {"max_threads": 2}}"#).unwrap();
    let args = RunArgs {
        config: Some(config),
        ..args(&dir)
    };
    assert_eq!(run(&args).unwrap(), 14);
}

#[test]
fn test_bad_config_is_reported() {
    let dir = workspace();
    let config = dir.path().join("farm.json");
    fs::write(&config, "{not json").unwrap();
    let args = RunArgs {
        config: Some(config),
        ..args(&dir)
    };
    assert!(matches!(run(&args), Err(CliError::Config(_))));
}
