use std::any::Any;
use std::thread;
use std::time::{Duration, Instant};

use collection_literals::btree;
use wasi_farm_park::memfs::{CaptureBuffer, ConsoleIn, ConsoleOut, MemFs};
use wasi_farm_park::{
    fdflags, oflags, rights, Descriptor, Errno, FarmError, Filetype, Notifications, Park,
    ParkConfig, Ref, WasiResult,
};
use wasi_farm_shm::{DualLockMode, ShmError};

const ROOT: u32 = 3;

struct Fixture {
    fs: MemFs,
    park: Park,
    stdout: CaptureBuffer,
}

fn start(config: ParkConfig) -> Fixture {
    let fs = MemFs::new();
    fs.write_file("main.rs", "fn main() {\n    println!(\"hi\");\n}\n").unwrap();
    fs.write_file("src/a.txt", "alpha").unwrap();
    fs.create_dir_all("dst").unwrap();

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
    Fixture {
        fs,
        park,
        stdout: captured,
    }
}

fn open(remote: &Ref, path: &str) -> u32 {
    remote
        .path_open(ROOT, 0, path.as_bytes(), 0, rights::ALL, rights::ALL, 0)
        .unwrap()
        .unwrap()
}

#[test]
fn test_read_file_until_eof() {
    let fixture = start(ParkConfig::default());
    let remote = Ref::new(fixture.park.ref_object()).unwrap();

    let fd = open(&remote, "main.rs");
    assert_eq!(fd, 4);
    assert_eq!(remote.get_fds_len(), 5);

    let mut contents = Vec::new();
    loop {
        let chunk = remote.fd_read(fd, 8).unwrap().unwrap();
        if chunk.is_empty() {
            break;
        }
        assert!(chunk.len() <= 8);
        contents.extend(chunk);
    }
    assert_eq!(contents, fixture.fs.read_file("main.rs").unwrap());
    remote.fd_close(fd).unwrap().unwrap();
    assert!(!fixture.park.is_open(fd));
}

#[test]
fn test_stdio_and_preopen_from_ref_object() {
    let fixture = start(ParkConfig::default());
    let object = fixture.park.ref_object();
    assert_eq!(object.stdio(), [Some(0), Some(1), Some(2)]);
    assert_eq!(object.allow_list(), &[0, 1, 2, 3]);

    let remote = Ref::new(object).unwrap();
    assert_eq!(remote.fd_write(1, b"hello\n").unwrap().unwrap(), 6);
    assert_eq!(fixture.stdout.text(), "hello\n");

    let prestat = remote.fd_prestat_get(ROOT).unwrap().unwrap();
    assert_eq!(prestat.name_len, 1);
    assert_eq!(remote.fd_prestat_dir_name(ROOT).unwrap().unwrap(), b"/");
    assert_eq!(remote.fd_prestat_get(1).unwrap(), Err(Errno::BADF));
}

#[test]
fn test_close_notifies_other_refs() {
    let fixture = start(ParkConfig::default());
    let a = Ref::new(fixture.park.ref_object()).unwrap();
    let b = Ref::new(fixture.park.ref_object()).unwrap();
    assert_eq!((a.id(), b.id()), (0, 1));

    let fd = open(&a, "main.rs");
    assert_eq!(fixture.park.watchers(fd), vec![0, 1]);
    assert_eq!(
        b.take_notifications(),
        Notifications {
            closed: vec![],
            opened: vec![fd],
        }
    );
    assert_eq!(a.take_notifications(), Notifications::default());

    a.fd_close(fd).unwrap().unwrap();
    assert_eq!(
        b.take_notifications(),
        Notifications {
            closed: vec![fd],
            opened: vec![],
        }
    );
    assert_eq!(a.take_notifications(), Notifications::default());
    assert_eq!(b.fd_read(fd, 4).unwrap(), Err(Errno::BADF));
    assert_eq!(a.fd_close(fd).unwrap(), Err(Errno::BADF));
    assert!(fixture.park.watchers(fd).is_empty());
}

#[test]
fn test_open_then_close_before_notice_is_not_reported_open() {
    let fixture = start(ParkConfig::default());
    let a = Ref::new(fixture.park.ref_object()).unwrap();
    let b = Ref::new(fixture.park.ref_object()).unwrap();

    let fd = open(&a, "main.rs");
    a.fd_close(fd).unwrap().unwrap();

    let notices = b.take_notifications();
    assert!(notices.opened.is_empty());
    assert_eq!(notices.closed, vec![fd]);
}

#[test]
fn test_visibility_registration() {
    let fixture = start(ParkConfig::default());
    let remote = Ref::new(fixture.park.ref_object()).unwrap();

    remote.register_visibility(ROOT).unwrap().unwrap();
    assert_eq!(fixture.park.watchers(ROOT), vec![0]);
    remote.unregister_visibility(ROOT).unwrap().unwrap();
    assert!(fixture.park.watchers(ROOT).is_empty());

    assert_eq!(remote.register_visibility(40).unwrap(), Err(Errno::BADF));
}

#[test]
fn test_fd_table_cap_reports_nfile() {
    let fixture = start(ParkConfig {
        max_fds: 5,
        ..ParkConfig::default()
    });
    let remote = Ref::new(fixture.park.ref_object()).unwrap();

    let fd = open(&remote, "main.rs");
    assert_eq!(fd, 4);
    let full = remote.path_open(ROOT, 0, b"src/a.txt", 0, rights::ALL, rights::ALL, 0);
    assert_eq!(full.unwrap(), Err(Errno::NFILE));

    remote.fd_close(fd).unwrap().unwrap();
    assert_eq!(open(&remote, "src/a.txt"), 4);
    assert_eq!(fixture.park.open_count(), 5);
}

#[test]
fn test_missing_fds_and_paths() {
    let fixture = start(ParkConfig::default());
    let remote = Ref::new(fixture.park.ref_object()).unwrap();

    let absent = remote.path_open(99, 0, b"main.rs", 0, rights::ALL, rights::ALL, 0);
    assert_eq!(absent.unwrap(), Err(Errno::BADF));

    let missing = remote.path_open(ROOT, 0, b"nope.rs", 0, rights::ALL, rights::ALL, 0);
    assert_eq!(missing.unwrap(), Err(Errno::NOENT));

    let long = vec![b'x'; remote.max_payload() + 1];
    assert_eq!(
        remote.path_filestat_get(ROOT, 0, &long).unwrap(),
        Err(Errno::NAMETOOLONG)
    );
}

#[test]
fn test_create_write_and_stat() {
    let fixture = start(ParkConfig::default());
    let remote = Ref::new(fixture.park.ref_object()).unwrap();

    let fd = remote
        .path_open(
            ROOT,
            0,
            b"out.log",
            oflags::CREAT,
            rights::ALL,
            rights::ALL,
            fdflags::APPEND,
        )
        .unwrap()
        .unwrap();
    remote.fd_write(fd, b"one ").unwrap().unwrap();
    remote.fd_write(fd, b"two").unwrap().unwrap();
    assert_eq!(fixture.fs.read_file("out.log").unwrap(), b"one two");

    let stat = remote.fd_filestat_get(fd).unwrap().unwrap();
    assert_eq!(stat.size, 7);
    let fdstat = remote.fd_fdstat_get(fd).unwrap().unwrap();
    assert_eq!(fdstat.flags, fdflags::APPEND);

    assert_eq!(remote.fd_pwrite(fd, b"ONE", 0).unwrap().unwrap(), 3);
    assert_eq!(remote.fd_pread(fd, 3, 4).unwrap().unwrap(), b"two");
    assert_eq!(fixture.fs.read_file("out.log").unwrap(), b"ONE two");
}

#[test]
fn test_writes_larger_than_payload_are_chunked() {
    let fixture = start(ParkConfig {
        allocator_capacity: 64,
        ..ParkConfig::default()
    });
    let remote = Ref::new(fixture.park.ref_object()).unwrap();
    assert_eq!(remote.max_payload(), 16);

    let fd = remote
        .path_open(ROOT, 0, b"big", oflags::CREAT, rights::ALL, rights::ALL, 0)
        .unwrap()
        .unwrap();
    let data: Vec<u8> = (0..100u8).collect();
    assert_eq!(remote.fd_write(fd, &data).unwrap().unwrap(), 100);
    assert_eq!(fixture.fs.read_file("big").unwrap(), data);

    let read = remote.fd_pread(fd, 100, 0).unwrap().unwrap();
    assert_eq!(read, data[..16]);
}

#[test]
fn test_rename_and_link_across_directories() {
    let fixture = start(ParkConfig::default());
    let remote = Ref::new(fixture.park.ref_object())
        .unwrap()
        .with_dual_lock_mode(DualLockMode::Backoff { retries: 4 });

    let src = open(&remote, "src");
    let dst = open(&remote, "dst");

    remote.path_rename(src, b"a.txt", dst, b"b.txt").unwrap().unwrap();
    remote.path_link(dst, 0, b"b.txt", src, b"again.txt").unwrap().unwrap();

    let expected = btree! {
        "dst/b.txt" => true,
        "src/a.txt" => false,
        "src/again.txt" => true,
    };
    for (path, present) in expected {
        assert_eq!(fixture.fs.exists(path), present, "{path}");
    }
    assert_eq!(fixture.fs.read_file("src/again.txt").unwrap(), b"alpha");

    let stat = remote.path_filestat_get(ROOT, 0, b"dst/b.txt").unwrap().unwrap();
    assert_eq!(stat.nlink, 2);
    assert_eq!(
        remote.path_rename(src, b"missing", 77, b"x").unwrap(),
        Err(Errno::BADF)
    );
}

#[test]
fn test_directory_operations() {
    let fixture = start(ParkConfig::default());
    let remote = Ref::new(fixture.park.ref_object()).unwrap();

    remote.path_create_directory(ROOT, b"made").unwrap().unwrap();
    assert_eq!(
        remote.path_create_directory(ROOT, b"made").unwrap(),
        Err(Errno::EXIST)
    );
    remote.path_symlink(b"main.rs", ROOT, b"made/link").unwrap().unwrap();
    assert_eq!(
        remote.path_readlink(ROOT, b"made/link", 64).unwrap().unwrap(),
        b"main.rs"
    );
    assert_eq!(
        remote.path_remove_directory(ROOT, b"made").unwrap(),
        Err(Errno::NOTEMPTY)
    );
    remote.path_unlink_file(ROOT, b"made/link").unwrap().unwrap();
    remote.path_remove_directory(ROOT, b"made").unwrap().unwrap();
    assert!(!fixture.fs.exists("made"));

    let listing = remote.fd_readdir(ROOT, 4096, 0).unwrap().unwrap();
    let text = String::from_utf8_lossy(&listing);
    assert!(text.contains("main.rs"));
    assert!(text.contains("dst"));
}

#[test]
fn test_ref_ids_are_bounded() {
    let fixture = start(ParkConfig {
        max_refs: 2,
        ..ParkConfig::default()
    });
    let _a = Ref::new(fixture.park.ref_object()).unwrap();
    let _b = Ref::new(fixture.park.ref_object()).unwrap();
    assert_eq!(
        Ref::new(fixture.park.ref_object()).unwrap_err(),
        FarmError::RefIdExhausted(2)
    );
}

#[test]
fn test_ref_ids_are_reused_after_drop() {
    let fixture = start(ParkConfig {
        max_refs: 2,
        ..ParkConfig::default()
    });
    let keeper = Ref::new(fixture.park.ref_object()).unwrap();
    let fd = open(&keeper, "main.rs");
    assert_eq!(fixture.park.watchers(fd), vec![0]);

    for _ in 0..10 {
        let remote = Ref::new(fixture.park.ref_object()).unwrap();
        assert_eq!(remote.id(), 1);
        assert_eq!(remote.take_notifications(), Notifications::default());
        remote.register_visibility(fd).unwrap().unwrap();
        assert_eq!(fixture.park.watchers(fd), vec![0, 1]);

        // Left unread; the next Ref with this id must not see it.
        let other = open(&keeper, "src/a.txt");
        keeper.fd_close(other).unwrap().unwrap();
    }
    assert_eq!(fixture.park.watchers(fd), vec![0]);
    keeper.fd_close(fd).unwrap().unwrap();
}

#[test]
fn test_pair_ops_share_a_small_allocator() {
    let fixture = start(ParkConfig {
        allocator_capacity: 64,
        ..ParkConfig::default()
    });
    let setup = Ref::new(fixture.park.ref_object()).unwrap();
    let dirs = [(ROOT, ""), (open(&setup, "src"), "src/"), (open(&setup, "dst"), "dst/")];

    let started = Instant::now();
    let handles: Vec<_> = dirs
        .iter()
        .map(|&(fd, _)| {
            let object = fixture.park.ref_object();
            thread::spawn(move || {
                let remote = Ref::new(object)
                    .unwrap()
                    .with_timeout(Some(Duration::from_secs(10)));
                for i in 0..20 {
                    let link = format!("link-{i:02}-abcdef");
                    remote
                        .path_symlink(b"target-abcdefgh", fd, link.as_bytes())
                        .unwrap()
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(started.elapsed() < Duration::from_secs(10));

    for (_, prefix) in dirs {
        for i in 0..20 {
            assert!(fixture.fs.exists(&format!("{prefix}link-{i:02}-abcdef")));
        }
    }
    assert_eq!(fixture.park.live_payloads(), 0);
}

fn opposite_renames(mode: DualLockMode) {
    const WORKERS: usize = 4;
    const ROUNDS: usize = 25;

    let fixture = start(ParkConfig::default());
    let setup = Ref::new(fixture.park.ref_object()).unwrap();
    let (src, dst) = (open(&setup, "src"), open(&setup, "dst"));
    let home = |worker: usize| if worker % 2 == 0 { ("src", "dst") } else { ("dst", "src") };
    for worker in 0..WORKERS {
        for round in 0..ROUNDS {
            let path = format!("{}/w{worker}-{round}", home(worker).0);
            fixture.fs.write_file(&path, "x").unwrap();
        }
    }

    let started = Instant::now();
    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let object = fixture.park.ref_object();
            thread::spawn(move || {
                let remote = Ref::new(object)
                    .unwrap()
                    .with_timeout(Some(Duration::from_secs(10)))
                    .with_dual_lock_mode(mode);
                let (from, to) = if worker % 2 == 0 { (src, dst) } else { (dst, src) };
                for round in 0..ROUNDS {
                    let name = format!("w{worker}-{round}");
                    let renamed = remote.path_rename(from, name.as_bytes(), to, name.as_bytes());
                    assert_eq!(renamed, Ok(Ok(())), "{name}");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(started.elapsed() < Duration::from_secs(10));

    for worker in 0..WORKERS {
        for round in 0..ROUNDS {
            let path = format!("{}/w{worker}-{round}", home(worker).1);
            assert!(fixture.fs.exists(&path), "{path}");
        }
    }
    assert_eq!(fixture.park.live_payloads(), 0);
}

#[test]
fn test_opposite_order_renames_ordered() {
    opposite_renames(DualLockMode::Ordered);
}

#[test]
fn test_opposite_order_renames_with_backoff() {
    opposite_renames(DualLockMode::Backoff { retries: 3 });
}

/// Character device whose reads take `delay`.
struct SlowDevice {
    delay: Duration,
}

impl Descriptor for SlowDevice {
    fn filetype(&self) -> Filetype {
        Filetype::CharacterDevice
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn fd_read(&mut self, len: usize) -> WasiResult<Vec<u8>> {
        thread::sleep(self.delay);
        Ok(vec![b'z'; len.min(4)])
    }
}

#[test]
fn test_abandoned_read_is_released_by_park() {
    let (stdout, _) = ConsoleOut::capture();
    let (stderr, _) = ConsoleOut::capture();
    let descriptors: Vec<Box<dyn Descriptor>> = vec![
        Box::new(ConsoleIn::from_bytes("")),
        Box::new(stdout),
        Box::new(stderr),
        Box::new(SlowDevice {
            delay: Duration::from_millis(500),
        }),
    ];
    let park = Park::new(descriptors, ParkConfig::default()).unwrap();
    park.listen().unwrap();
    let slow = 3;

    let impatient = Ref::new(park.ref_object())
        .unwrap()
        .with_timeout(Some(Duration::from_millis(100)));
    assert_eq!(
        impatient.fd_read(slow, 4).unwrap_err(),
        FarmError::Shm(ShmError::Abandoned)
    );

    // Waits for the Park to reset the abandoned call, then runs normally.
    let remote = Ref::new(park.ref_object()).unwrap();
    assert_eq!(remote.fd_read(slow, 4).unwrap().unwrap(), b"zzzz");
    assert_eq!(park.live_payloads(), 0);
}

#[test]
fn test_listen_twice_is_rejected() {
    let fixture = start(ParkConfig::default());
    assert!(matches!(
        fixture.park.listen(),
        Err(FarmError::Protocol(_))
    ));
}

#[test]
fn test_invalid_stdio_index_is_rejected() {
    let descriptors: Vec<Box<dyn Descriptor>> = vec![Box::new(ConsoleIn::from_bytes(""))];
    let result = Park::new(descriptors, ParkConfig::default());
    assert!(matches!(result, Err(FarmError::InvalidHandle(_))));
}

#[tokio::test]
async fn test_refs_on_many_workers_share_stdout() {
    let fixture = start(ParkConfig::default());
    let object = fixture.park.ref_object();

    let mut handles = Vec::new();
    for worker in 0..4u8 {
        let object = object.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let remote = Ref::new(object).unwrap();
            for _ in 0..50 {
                remote.fd_write(1, &[b'a' + worker, b'\n']).unwrap().unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let out = fixture.stdout.contents();
    assert_eq!(out.len(), 4 * 50 * 2);
    for worker in 0..4u8 {
        let lines = out.chunks(2).filter(|line| line[0] == b'a' + worker).count();
        assert_eq!(lines, 50);
    }
}

#[tokio::test]
async fn test_opens_from_concurrent_refs_get_distinct_fds() {
    let fixture = start(ParkConfig::default());
    let park = fixture.park.clone();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let object = park.ref_object();
        handles.push(tokio::task::spawn_blocking(move || {
            let remote = Ref::new(object).unwrap();
            open(&remote, "main.rs")
        }));
    }
    let mut fds = Vec::new();
    for handle in handles {
        fds.push(handle.await.unwrap());
    }
    fds.sort_unstable();
    assert_eq!(fds, (4..12).collect::<Vec<u32>>());
    assert_eq!(park.fds_len(), 12);
}
