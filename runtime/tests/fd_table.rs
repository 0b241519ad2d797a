use wasi_farm_park::memfs::{CaptureBuffer, ConsoleIn, ConsoleOut, MemFs};
use wasi_farm_park::{rights, Descriptor, Errno, Park, ParkConfig};
use wasi_farm_runtime::{FarmConfig, FdEntry, FdSeed, FdTable, RuntimeError};

const ROOT: u32 = 3;

fn start(fs: &MemFs, config: ParkConfig) -> (Park, CaptureBuffer) {
    let (stdout, captured) = ConsoleOut::capture();
    let (stderr, _) = ConsoleOut::capture();
    let descriptors: Vec<Box<dyn Descriptor>> = vec![
        Box::new(ConsoleIn::from_bytes("")),
        Box::new(stdout),
        Box::new(stderr),
        Box::new(fs.preopen("/")),
    ];
    let park = Park::new(descriptors, config).unwrap();
    park.listen().unwrap();
    (park, captured)
}

fn fixture() -> (MemFs, Park, CaptureBuffer) {
    let fs = MemFs::new();
    fs.write_file("main.rs", "fn main() {}\n").unwrap();
    fs.create_dir_all("out").unwrap();
    let (park, stdout) = start(&fs, ParkConfig::default());
    (fs, park, stdout)
}

fn table(park: &Park) -> FdTable {
    FdTable::new(vec![park.ref_object()], FdSeed::Initial, &FarmConfig::default()).unwrap()
}

fn open(table: &mut FdTable, path: &str) -> u32 {
    table
        .path_open(ROOT, 0, path.as_bytes(), 0, rights::ALL, rights::ALL, 0)
        .unwrap()
        .unwrap()
}

fn read_to_end(table: &mut FdTable, fd: u32) -> Vec<u8> {
    let mut contents = Vec::new();
    loop {
        let chunk = table.fd_read(fd, 8).unwrap().unwrap();
        if chunk.is_empty() {
            return contents;
        }
        contents.extend(chunk);
    }
}

#[test]
fn test_tables_outnumber_ref_ids_over_time() {
    let fs = MemFs::new();
    fs.write_file("main.rs", "fn main() {}\n").unwrap();
    let (park, _) = start(
        &fs,
        ParkConfig {
            max_refs: 2,
            ..ParkConfig::default()
        },
    );

    let _long_lived = table(&park);
    for _ in 0..10 {
        let mut short_lived = table(&park);
        let fd = open(&mut short_lived, "main.rs");
        assert_eq!(read_to_end(&mut short_lived, fd), b"fn main() {}\n");
        short_lived.fd_close(fd).unwrap().unwrap();
    }
}

#[test]
fn test_initial_map() {
    let (_fs, park, _) = fixture();
    let table = table(&park);

    for fd in 0..=ROOT {
        assert_eq!(table.entry(fd), Some(FdEntry { park: 0, remote: fd }));
    }
    assert_eq!(table.entry(4), None);
    assert_eq!(table.refs().len(), 1);
}

#[test]
fn test_stdout_reaches_park() {
    let (_fs, park, stdout) = fixture();
    let mut table = table(&park);

    assert_eq!(table.fd_write(1, b"hi\n").unwrap().unwrap(), 3);
    assert_eq!(stdout.text(), "hi\n");
}

#[test]
fn test_open_is_seen_lazily_by_other_table() {
    let (fs, park, _) = fixture();
    let mut a = table(&park);
    let mut b = table(&park);

    let fd = open(&mut a, "main.rs");
    assert_eq!(fd, 4);
    assert_eq!(b.entry(4), None);

    b.check_fds().unwrap();
    let seen = b.lookup(0, 4).unwrap();
    assert_eq!(read_to_end(&mut b, seen), fs.read_file("main.rs").unwrap());
}

#[test]
fn test_close_is_seen_lazily_by_other_table() {
    let (_fs, park, _) = fixture();
    let mut a = table(&park);
    let mut b = table(&park);

    let fd = open(&mut a, "main.rs");
    b.check_fds().unwrap();
    assert!(b.entry(fd).is_some());

    a.fd_close(fd).unwrap().unwrap();
    assert_eq!(a.entry(fd), None);
    assert!(!park.is_open(4));

    // Nothing changes for b until its next call.
    assert!(b.entry(fd).is_some());
    assert_eq!(b.fd_read(fd, 8).unwrap(), Err(Errno::BADF));
    assert_eq!(b.entry(fd), None);
}

#[test]
fn test_closed_fd_number_is_reused() {
    let (_fs, park, _) = fixture();
    let mut table = table(&park);

    let first = open(&mut table, "main.rs");
    table.fd_close(first).unwrap().unwrap();
    assert_eq!(table.fd_close(first).unwrap(), Err(Errno::BADF));
    let second = open(&mut table, "main.rs");
    assert_eq!(first, second);
}

#[test]
fn test_snapshot_seed_keeps_opened_fds() {
    let (fs, park, _) = fixture();
    let mut parent = table(&park);
    let fd = open(&mut parent, "main.rs");

    let mut sibling = FdTable::new(
        vec![park.ref_object()],
        FdSeed::Snapshot(parent.snapshot()),
        &FarmConfig::default(),
    )
    .unwrap();
    assert_eq!(sibling.entry(fd), parent.entry(fd));
    assert_eq!(read_to_end(&mut sibling, fd), fs.read_file("main.rs").unwrap());
}

#[test]
fn test_renumber_moves_mapping() {
    let (_fs, park, _) = fixture();
    let mut table = table(&park);
    let a = open(&mut table, "main.rs");
    let b = open(&mut table, "main.rs");

    let moved = table.entry(a);
    table.fd_renumber(a, b).unwrap().unwrap();
    assert_eq!(table.entry(a), None);
    assert_eq!(table.entry(b), moved);
    assert_eq!(table.fd_renumber(a, b).unwrap(), Err(Errno::BADF));
}

#[test]
fn test_missing_stdio() {
    let fs = MemFs::new();
    let (park, _) = start(
        &fs,
        ParkConfig {
            stdin: None,
            ..ParkConfig::default()
        },
    );

    let err = FdTable::new(vec![park.ref_object()], FdSeed::Initial, &FarmConfig::default())
        .unwrap_err();
    assert!(matches!(err, RuntimeError::MissingStdio(0)));
}

#[test]
fn test_two_parks_share_one_fd_space() {
    let left = MemFs::new();
    left.write_file("main.rs", "left").unwrap();
    let right = MemFs::new();
    right.write_file("main.rs", "right").unwrap();
    let (left_park, _) = start(&left, ParkConfig::default());
    let (right_park, _) = start(&right, ParkConfig::default());

    let mut table = FdTable::new(
        vec![left_park.ref_object(), right_park.ref_object()],
        FdSeed::Initial,
        &FarmConfig::default(),
    )
    .unwrap();
    assert_eq!(table.entry(ROOT), Some(FdEntry { park: 0, remote: 3 }));
    assert_eq!(table.entry(4), Some(FdEntry { park: 1, remote: 3 }));

    let fd = table
        .path_open(4, 0, b"main.rs", 0, rights::ALL, rights::ALL, 0)
        .unwrap()
        .unwrap();
    assert_eq!(fd, 5);
    assert_eq!(read_to_end(&mut table, fd), b"right");

    assert_eq!(
        table.path_rename(ROOT, b"main.rs", 4, b"moved.rs").unwrap(),
        Err(Errno::BADF)
    );
    assert!(left.exists("main.rs"));
    assert!(!right.exists("moved.rs"));
}
