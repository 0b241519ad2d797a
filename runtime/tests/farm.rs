use std::time::Duration;

use wasi_farm_park::memfs::{CaptureBuffer, ConsoleIn, ConsoleOut, MemFs};
use wasi_farm_park::{Descriptor, Park, ParkConfig};
use wasi_farm_runtime::{AnimalOptions, Farm, FarmConfig, RuntimeError};

const MAIN_RS: &str = "fn main() {}\n";

/// Opens `main.rs` under the preopen, reads it 8 bytes at a time until EOF,
/// echoes it to stdout and exits with the byte count.
const READ_MAIN: &str = r#"
(module
  (import "wasi_snapshot_preview1" "path_open"
    (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_read"
    (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "main.rs")
  (func (export "_start")
    (local $fd i32) (local $total i32) (local $n i32)
    (if (call $path_open (i32.const 3) (i32.const 0) (i32.const 0) (i32.const 7)
                         (i32.const 0) (i64.const 536870911) (i64.const 536870911)
                         (i32.const 0) (i32.const 16))
      (then (call $proc_exit (i32.const 100))))
    (local.set $fd (i32.load (i32.const 16)))
    (block $eof
      (loop $next
        (i32.store (i32.const 24) (i32.add (i32.const 64) (local.get $total)))
        (i32.store (i32.const 28) (i32.const 8))
        (if (call $fd_read (local.get $fd) (i32.const 24) (i32.const 1) (i32.const 20))
          (then (call $proc_exit (i32.const 101))))
        (local.set $n (i32.load (i32.const 20)))
        (br_if $eof (i32.eqz (local.get $n)))
        (local.set $total (i32.add (local.get $total) (local.get $n)))
        (br $next)))
    (i32.store (i32.const 24) (i32.const 64))
    (i32.store (i32.const 28) (local.get $total))
    (drop (call $fd_write (i32.const 1) (i32.const 24) (i32.const 1) (i32.const 32)))
    (call $proc_exit (local.get $total))))
"#;

/// Spawns one sibling with argument 40, waits for it to publish
/// `arg + tid` at address 0 and exits with that value.
const SPAWN_ONE: &str = r#"
(module
  (import "env" "memory" (memory 1 1 shared))
  (import "wasi" "thread-spawn" (func $spawn (param i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (func (export "_start")
    (local $tid i32) (local $value i32)
    (local.set $tid (call $spawn (i32.const 40)))
    (if (i32.lt_s (local.get $tid) (i32.const 1))
      (then (call $proc_exit (i32.const 200))))
    (loop $wait
      (local.set $value (i32.atomic.load (i32.const 0)))
      (br_if $wait (i32.eqz (local.get $value))))
    (call $proc_exit (local.get $value)))
  (func (export "wasi_thread_start") (param $tid i32) (param $arg i32)
    (i32.atomic.store (i32.const 0) (i32.add (local.get $arg) (local.get $tid)))))
"#;

/// The sibling traps while the start worker spins forever.
const SIBLING_TRAPS: &str = r#"
(module
  (import "env" "memory" (memory 1 1 shared))
  (import "wasi" "thread-spawn" (func $spawn (param i32) (result i32)))
  (func (export "_start")
    (drop (call $spawn (i32.const 0)))
    (loop $spin (br $spin)))
  (func (export "wasi_thread_start") (param i32 i32)
    unreachable))
"#;

/// Exits with the negated `thread-spawn` result.
const SPAWN_PRIVATE: &str = r#"
(module
  (import "wasi" "thread-spawn" (func $spawn (param i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (call $proc_exit (i32.sub (i32.const 0) (call $spawn (i32.const 0))))))
"#;

/// Exits with `argc * 10 + environ count`.
const COUNT_ARGS: &str = r#"
(module
  (import "wasi_snapshot_preview1" "args_sizes_get"
    (func $args_sizes (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "environ_sizes_get"
    (func $environ_sizes (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (drop (call $args_sizes (i32.const 0) (i32.const 4)))
    (drop (call $environ_sizes (i32.const 8) (i32.const 12)))
    (call $proc_exit
      (i32.add (i32.mul (i32.load (i32.const 0)) (i32.const 10))
               (i32.load (i32.const 8))))))
"#;

/// Returns the errno of `clock_time_get` on an unknown clock.
const BAD_CLOCK: &str = r#"
(module
  (import "wasi_snapshot_preview1" "clock_time_get"
    (func $clock_time_get (param i32 i64 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (call $proc_exit (call $clock_time_get (i32.const 99) (i64.const 1) (i32.const 0)))))
"#;

/// Exits with `random_get` errnos: a length past the address space times
/// 100, plus a buffer ending exactly at the end of memory.
const RANDOM_BOUNDS: &str = r#"
(module
  (import "wasi_snapshot_preview1" "random_get"
    (func $random_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (call $proc_exit
      (i32.add
        (i32.mul (call $random_get (i32.const 0) (i32.const -1)) (i32.const 100))
        (call $random_get (i32.const 65520) (i32.const 16))))))
"#;

/// Returns from `_start` without calling `proc_exit`.
const RETURNS: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "_start")))
"#;

struct Fixture {
    _fs: MemFs,
    park: Park,
    stdout: CaptureBuffer,
}

fn fixture() -> Fixture {
    let fs = MemFs::new();
    fs.write_file("main.rs", MAIN_RS).unwrap();

    let (stdout, captured) = ConsoleOut::capture();
    let (stderr, _) = ConsoleOut::capture();
    let descriptors: Vec<Box<dyn Descriptor>> = vec![
        Box::new(ConsoleIn::from_bytes("")),
        Box::new(stdout),
        Box::new(stderr),
        Box::new(fs.preopen("/")),
    ];
    let park = Park::new(descriptors, ParkConfig::default()).unwrap();
    park.listen().unwrap();
    Fixture {
        _fs: fs,
        park,
        stdout: captured,
    }
}

fn config() -> FarmConfig {
    FarmConfig {
        call_timeout: Some(Duration::from_secs(10)),
        shutdown_grace: Duration::from_secs(5),
        ..FarmConfig::default()
    }
}

fn farm(wat: &str, fixture: &Fixture, options: AnimalOptions) -> Farm {
    let engine = Farm::engine().unwrap();
    Farm::new(
        &engine,
        wat,
        vec![fixture.park.ref_object()],
        options,
        config(),
    )
    .unwrap()
}

#[test]
fn test_read_main_rs_to_eof() {
    let fixture = fixture();
    let farm = farm(READ_MAIN, &fixture, AnimalOptions::new(["read-main"]));
    assert!(!farm.is_threaded());

    assert_eq!(farm.run().unwrap(), MAIN_RS.len() as i32);
    assert_eq!(fixture.stdout.text(), MAIN_RS);
}

#[test]
fn test_animal_starts_on_current_thread() {
    let fixture = fixture();
    let farm = farm(READ_MAIN, &fixture, AnimalOptions::default());

    let mut animal = farm.animal().unwrap();
    assert!(animal.state().spawner().is_none());
    assert_eq!(animal.start().unwrap(), MAIN_RS.len() as i32);
    assert_eq!(fixture.stdout.text(), MAIN_RS);
}

#[tokio::test]
async fn test_run_async() {
    let fixture = fixture();
    let farm = farm(READ_MAIN, &fixture, AnimalOptions::default());

    assert_eq!(farm.run_async().await.unwrap(), MAIN_RS.len() as i32);
}

#[test]
fn test_returning_start_exits_zero() {
    let fixture = fixture();
    let report = farm(RETURNS, &fixture, AnimalOptions::default())
        .run_report()
        .unwrap();
    assert_eq!(report.exit_code, 0);
    assert!(report.error.is_none());
    assert!(report.terminated.is_empty());
}

#[test]
fn test_thread_spawn_relays_id_and_exit_code() {
    let fixture = fixture();
    let farm = farm(SPAWN_ONE, &fixture, AnimalOptions::default());
    assert!(farm.is_threaded());

    let report = farm.run_report().unwrap();
    assert_eq!(report.exit_code, 41);
    assert!(report.error.is_none());
    assert_eq!(report.threads.get(&1), Some(&0));
}

#[test]
fn test_sibling_trap_terminates_farm() {
    let fixture = fixture();
    let farm = farm(SIBLING_TRAPS, &fixture, AnimalOptions::default());

    let report = farm.run_report().unwrap();
    let error = report.error.unwrap();
    assert_eq!(error.name, "Trap");
    assert!(error.message.contains("unreachable"), "{error}");
    assert_eq!(report.exit_code, 1);
    assert!(report.terminated.contains(&0));
}

#[tokio::test]
async fn test_sibling_trap_is_rethrown() {
    let fixture = fixture();
    let farm = farm(SIBLING_TRAPS, &fixture, AnimalOptions::default());

    let result = tokio::task::spawn_blocking(move || farm.run()).await.unwrap();
    match result {
        Err(RuntimeError::WorkerFailed(error)) => assert_eq!(error.name, "Trap"),
        other => panic!("expected WorkerFailed, got {other:?}"),
    }
}

#[test]
fn test_spawn_without_shared_memory_fails_in_guest() {
    let fixture = fixture();
    let farm = farm(SPAWN_PRIVATE, &fixture, AnimalOptions::default());

    assert_eq!(farm.run().unwrap(), 1);
}

#[test]
fn test_args_and_environ_sizes() {
    let fixture = fixture();
    let options = AnimalOptions::new(["app", "--flag"])
        .with_env("HOME", "/")
        .with_env("LANG", "C")
        .with_env("TERM", "dumb");
    let farm = farm(COUNT_ARGS, &fixture, options);

    assert_eq!(farm.run().unwrap(), 23);
}

#[test]
fn test_unknown_clock_is_inval() {
    let fixture = fixture();
    let farm = farm(BAD_CLOCK, &fixture, AnimalOptions::default());

    assert_eq!(farm.run().unwrap(), 28);
}

#[test]
fn test_random_get_rejects_out_of_range_buffer() {
    let fixture = fixture();
    let farm = farm(RANDOM_BOUNDS, &fixture, AnimalOptions::default());

    assert_eq!(farm.run().unwrap(), 2100);
}
