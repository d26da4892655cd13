//! End-to-end archive scenarios: create, fill, break, repair.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Duration;

use barecat::{
    Barecat, BarecatOptions, CancelToken, DuplicatePolicy, Error, MergeOptions, VerifyIssue,
    merge_copy, merge_symlink, sharder::shard_path,
};

fn archive_at(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

fn create(dir: &tempfile::TempDir, name: &str, shard_size_limit: Option<u64>) -> Barecat {
    Barecat::open_with(
        archive_at(dir, name),
        &BarecatOptions {
            readonly: false,
            shard_size_limit,
            ..BarecatOptions::default()
        },
    )
    .unwrap()
}

fn shard_len(base: &PathBuf, shard: u32) -> u64 {
    fs::metadata(shard_path(base, shard)).unwrap().len()
}

#[test]
fn empty_archive_listing() {
    let dir = tempfile::tempdir().unwrap();
    let bc = create(&dir, "empty.barecat", None);
    assert_eq!(bc.listdir("").unwrap(), Vec::<String>::new());
    let root = bc.index().lookup_dir("").unwrap();
    assert_eq!(root.num_files_tree, 0);
    assert_eq!(root.size_tree, 0);
}

#[test]
fn single_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let mut bc = create(&dir, "single.barecat", None);
    bc.put("a.txt", b"hello", false).unwrap();

    assert_eq!(bc.get("a.txt").unwrap(), b"hello");
    assert_eq!(bc.listdir("").unwrap(), ["a.txt"]);
    let root = bc.index().lookup_dir("").unwrap();
    assert_eq!(root.size_tree, 5);
    assert_eq!(root.num_files_tree, 1);
    assert_eq!(shard_len(&archive_at(&dir, "single.barecat"), 0), 5);
}

#[test]
fn nested_directory_propagation() {
    let dir = tempfile::tempdir().unwrap();
    let mut bc = create(&dir, "nested.barecat", None);
    bc.put("x/y/z.bin", &[0u8; 1000], false).unwrap();

    assert_eq!(bc.listdir("").unwrap(), ["x"]);
    assert_eq!(bc.listdir("x").unwrap(), ["y"]);
    assert_eq!(bc.listdir("x/y").unwrap(), ["z.bin"]);

    let root = bc.index().lookup_dir("").unwrap();
    assert_eq!(root.num_files_tree, 1);
    assert_eq!(root.size_tree, 1000);
    assert_eq!(root.num_subdirs, 1);
    assert_eq!(bc.index().lookup_dir("x").unwrap().num_subdirs, 1);
    assert_eq!(bc.index().lookup_dir("x/y").unwrap().num_files, 1);
}

#[test]
fn shard_rotation_at_limit() {
    let dir = tempfile::tempdir().unwrap();
    let base = archive_at(&dir, "rot.barecat");
    let mut bc = create(&dir, "rot.barecat", Some(100));
    bc.put("f1", &[1u8; 60], false).unwrap();
    bc.put("f2", &[2u8; 50], false).unwrap();
    bc.put("f3", &[3u8; 70], false).unwrap();

    for (path, shard, size) in [("f1", 0u32, 60u64), ("f2", 1, 50), ("f3", 2, 70)] {
        let info = bc.index().lookup_file(path).unwrap();
        assert_eq!((info.shard, info.offset, info.size), (shard, 0, size));
    }
    assert_eq!(shard_len(&base, 0), 60);
    assert_eq!(shard_len(&base, 1), 50);
    assert_eq!(shard_len(&base, 2), 70);

    // a file bigger than the limit still goes into one fresh shard
    bc.put("huge", &[4u8; 300], false).unwrap();
    let info = bc.index().lookup_file("huge").unwrap();
    assert_eq!((info.shard, info.offset), (3, 0));
    assert_eq!(shard_len(&base, 3), 300);
}

#[test]
fn deletion_leaves_hole_defrag_compacts() {
    let dir = tempfile::tempdir().unwrap();
    let base = archive_at(&dir, "holes.barecat");
    let mut bc = create(&dir, "holes.barecat", None);
    let b_bytes: Vec<u8> = (0..50u8).collect();
    bc.put("a", &[9u8; 100], false).unwrap();
    bc.put("b", &b_bytes, false).unwrap();
    bc.remove("a").unwrap();

    assert_eq!(bc.get("b").unwrap(), b_bytes);
    assert_eq!(shard_len(&base, 0), 150);

    let stats = bc.defrag(&CancelToken::new()).unwrap();
    assert_eq!(stats.bytes_reclaimed, 100);
    let info = bc.index().lookup_file("b").unwrap();
    assert_eq!(info.offset, 0);
    assert_eq!(shard_len(&base, 0), 50);
    assert_eq!(bc.get("b").unwrap(), b_bytes);

    // defrag is idempotent
    let stats = bc.defrag(&CancelToken::new()).unwrap();
    assert_eq!(stats.bytes_reclaimed, 0);
    assert_eq!(stats.files_moved, 0);
    assert_eq!(bc.get("b").unwrap(), b_bytes);
}

#[test]
fn crc_mismatch_detected() {
    let dir = tempfile::tempdir().unwrap();
    let base = archive_at(&dir, "crc.barecat");
    let mut bc = create(&dir, "crc.barecat", None);
    bc.put("good.bin", b"unharmed", false).unwrap();
    bc.put("bad.bin", b"payload!", false).unwrap();

    let info = bc.index().lookup_file("bad.bin").unwrap();
    let mut shard = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(shard_path(&base, info.shard))
        .unwrap();
    shard.seek(SeekFrom::Start(info.offset)).unwrap();
    let mut byte = [0u8; 1];
    shard.read_exact(&mut byte).unwrap();
    byte[0] ^= 0xff;
    shard.seek(SeekFrom::Start(info.offset)).unwrap();
    shard.write_all(&byte).unwrap();
    drop(shard);

    assert!(matches!(
        bc.get("bad.bin"),
        Err(Error::CrcMismatch { .. })
    ));
    assert_eq!(bc.get("good.bin").unwrap(), b"unharmed");

    let report = bc.verify_full(&CancelToken::new()).unwrap();
    let mismatches: Vec<&str> = report
        .issues
        .iter()
        .filter_map(|issue| match issue {
            VerifyIssue::CrcMismatch { path, .. } => Some(path.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(mismatches, ["bad.bin"]);
}

#[test]
fn reshard_respects_new_limit() {
    let dir = tempfile::tempdir().unwrap();
    let base = archive_at(&dir, "reshard.barecat");
    let mut bc = create(&dir, "reshard.barecat", None);
    bc.put("f1", &[1u8; 60], false).unwrap();
    bc.put("f2", &[2u8; 50], false).unwrap();
    bc.put("f3", &[3u8; 70], false).unwrap();
    bc.put("big", &[4u8; 250], false).unwrap();
    assert_eq!(shard_len(&base, 0), 430);

    bc.reshard(100, &CancelToken::new()).unwrap();

    assert_eq!(bc.shard_size_limit().unwrap(), 100);
    for path in ["f1", "f2", "f3", "big"] {
        let info = bc.index().lookup_file(path).unwrap();
        let len = shard_len(&base, info.shard);
        // every shard respects the limit except the one holding the
        // oversized file
        assert!(len <= 100 || (path == "big" && len == 250));
    }
    assert_eq!(bc.get("f1").unwrap(), vec![1u8; 60]);
    assert_eq!(bc.get("f2").unwrap(), vec![2u8; 50]);
    assert_eq!(bc.get("f3").unwrap(), vec![3u8; 70]);
    assert_eq!(bc.get("big").unwrap(), vec![4u8; 250]);
    assert!(bc.verify_full(&CancelToken::new()).unwrap().is_ok());
}

#[test]
fn defrag_smart_compacts_everything() {
    let dir = tempfile::tempdir().unwrap();
    let base = archive_at(&dir, "smart.barecat");
    let mut bc = create(&dir, "smart.barecat", None);
    for i in 0..10u8 {
        bc.put(&format!("f{i}"), &vec![i; 100], false).unwrap();
    }
    bc.remove("f0").unwrap();
    bc.remove("f4").unwrap();
    bc.remove("f5").unwrap();
    bc.put("empty", b"", false).unwrap();

    bc.defrag_smart(&CancelToken::new()).unwrap();

    assert_eq!(shard_len(&base, 0), 700);
    assert_eq!(bc.total_physical_size(), 700);
    for i in [1u8, 2, 3, 6, 7, 8, 9] {
        assert_eq!(bc.get(&format!("f{i}")).unwrap(), vec![i; 100]);
    }
    assert_eq!(bc.get("empty").unwrap(), b"");
    let report = bc.verify_full(&CancelToken::new()).unwrap();
    assert!(report.is_ok(), "issues: {:?}", report.issues);
}

#[test]
fn defrag_quick_fills_earlier_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let mut bc = create(&dir, "quick.barecat", None);
    bc.put("a", &[1u8; 100], false).unwrap();
    bc.put("b", &[2u8; 40], false).unwrap();
    bc.put("c", &[3u8; 60], false).unwrap();
    bc.remove("a").unwrap();

    let stats = bc
        .defrag_quick(Duration::from_secs(5), &CancelToken::new())
        .unwrap();
    assert!(stats.files_moved >= 1);
    assert!(bc.total_physical_size() < 200);
    assert_eq!(bc.get("b").unwrap(), vec![2u8; 40]);
    assert_eq!(bc.get("c").unwrap(), vec![3u8; 60]);
    assert!(bc.verify_full(&CancelToken::new()).unwrap().is_ok());
}

#[test]
fn cancellation_aborts_defrag() {
    let dir = tempfile::tempdir().unwrap();
    let mut bc = create(&dir, "cancel.barecat", None);
    bc.put("a", &[1u8; 10], false).unwrap();
    bc.put("b", &[2u8; 10], false).unwrap();
    bc.remove("a").unwrap();

    let token = CancelToken::new();
    token.cancel();
    assert!(matches!(bc.defrag(&token), Err(Error::Cancelled)));
    // nothing was lost
    assert_eq!(bc.get("b").unwrap(), vec![2u8; 10]);
}

#[test]
fn orphan_tail_flagged_by_quick_verify() {
    let dir = tempfile::tempdir().unwrap();
    let base = archive_at(&dir, "orphan.barecat");
    let mut bc = create(&dir, "orphan.barecat", None);
    bc.put("a", &[1u8; 30], false).unwrap();
    bc.close().unwrap();

    // simulate a crash between a shard append and the index commit
    let mut shard = fs::OpenOptions::new()
        .append(true)
        .open(shard_path(&base, 0))
        .unwrap();
    shard.write_all(&[0u8; 17]).unwrap();
    drop(shard);

    let bc = Barecat::open(&base).unwrap();
    let report = bc.verify_quick().unwrap();
    assert!(report.issues.iter().any(|issue| matches!(
        issue,
        VerifyIssue::OrphanTail { shard: 0, bytes: 17 }
    )));
}

#[test]
fn zero_size_files_share_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let mut bc = create(&dir, "zero.barecat", None);
    bc.put("empty1", b"", false).unwrap();
    bc.put("empty2", b"", false).unwrap();
    bc.put("real", b"content", false).unwrap();

    assert_eq!(bc.get("empty1").unwrap(), b"");
    assert_eq!(bc.get("empty2").unwrap(), b"");
    let e1 = bc.index().lookup_file("empty1").unwrap();
    let e2 = bc.index().lookup_file("empty2").unwrap();
    assert_eq!((e1.shard, e1.offset), (e2.shard, e2.offset));

    let report = bc.verify_full(&CancelToken::new()).unwrap();
    assert!(report.is_ok(), "issues: {:?}", report.issues);
    bc.defrag(&CancelToken::new()).unwrap();
    assert_eq!(bc.get("real").unwrap(), b"content");
}

#[test]
fn merge_copy_keep_first() {
    let dir = tempfile::tempdir().unwrap();
    let mut one = create(&dir, "one.barecat", None);
    one.put("shared.txt", b"from one", false).unwrap();
    one.put("only_one.txt", b"1", false).unwrap();
    one.close().unwrap();
    let mut two = create(&dir, "two.barecat", None);
    two.put("shared.txt", b"from two", false).unwrap();
    two.put("deep/only_two.txt", b"2", false).unwrap();
    two.close().unwrap();

    let sources = vec![
        archive_at(&dir, "one.barecat"),
        archive_at(&dir, "two.barecat"),
    ];
    let output = archive_at(&dir, "merged.barecat");
    merge_copy(
        &sources,
        &output,
        &MergeOptions {
            policy: DuplicatePolicy::KeepFirst,
            shard_size_limit: None,
        },
        &CancelToken::new(),
    )
    .unwrap();

    let bc = Barecat::open(&output).unwrap();
    assert_eq!(bc.get("shared.txt").unwrap(), b"from one");
    assert_eq!(bc.get("only_one.txt").unwrap(), b"1");
    assert_eq!(bc.get("deep/only_two.txt").unwrap(), b"2");
    assert_eq!(bc.num_files().unwrap(), 3);
    assert!(bc.verify_full(&CancelToken::new()).unwrap().is_ok());
}

#[test]
fn merge_copy_fails_on_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let mut one = create(&dir, "one.barecat", None);
    one.put("dup", b"x", false).unwrap();
    one.close().unwrap();
    let mut two = create(&dir, "two.barecat", None);
    two.put("dup", b"y", false).unwrap();
    two.close().unwrap();

    let sources = vec![
        archive_at(&dir, "one.barecat"),
        archive_at(&dir, "two.barecat"),
    ];
    let result = merge_copy(
        &sources,
        &archive_at(&dir, "merged.barecat"),
        &MergeOptions::default(),
        &CancelToken::new(),
    );
    assert!(matches!(result, Err(Error::AlreadyExists(_))));
}

#[cfg(unix)]
#[test]
fn merge_symlink_preserves_bytes() {
    let dir = tempfile::tempdir().unwrap();
    // two shards in the first source, one in the second
    let mut one = create(&dir, "one.barecat", Some(100));
    one.put("a", &[1u8; 80], false).unwrap();
    one.put("b", &[2u8; 80], false).unwrap();
    one.close().unwrap();
    let mut two = create(&dir, "two.barecat", None);
    two.put("sub/c", &[3u8; 40], false).unwrap();
    two.close().unwrap();

    let sources = vec![
        archive_at(&dir, "one.barecat"),
        archive_at(&dir, "two.barecat"),
    ];
    let output = archive_at(&dir, "linked.barecat");
    merge_symlink(
        &sources,
        &output,
        DuplicatePolicy::Fail,
        &CancelToken::new(),
    )
    .unwrap();

    // shards are renumbered symlinks, no bytes copied
    for shard in 0..3 {
        assert!(
            fs::symlink_metadata(shard_path(&output, shard))
                .unwrap()
                .file_type()
                .is_symlink()
        );
    }
    let bc = Barecat::open(&output).unwrap();
    assert_eq!(bc.get("a").unwrap(), vec![1u8; 80]);
    assert_eq!(bc.get("b").unwrap(), vec![2u8; 80]);
    assert_eq!(bc.get("sub/c").unwrap(), vec![3u8; 40]);
    assert_eq!(bc.index().lookup_file("sub/c").unwrap().shard, 2);
    assert_eq!(bc.index().lookup_dir("").unwrap().num_files_tree, 3);
    assert!(bc.verify_full(&CancelToken::new()).unwrap().is_ok());
}

#[test]
fn bulk_import_then_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let mut bc = create(&dir, "bulk.barecat", None);
    bc.bulk_import(|bc| {
        for i in 0..100 {
            bc.put(
                &format!("data/part{}/rec{i:03}.bin", i % 7),
                &vec![0xabu8; i],
                false,
            )?;
        }
        Ok(())
    })
    .unwrap();

    assert_eq!(bc.num_files().unwrap(), 100);
    assert_eq!(
        bc.total_logical_size().unwrap(),
        (0..100u64).sum::<u64>()
    );
    assert_eq!(bc.index().lookup_dir("data").unwrap().num_subdirs, 7);
    let report = bc.verify_full(&CancelToken::new()).unwrap();
    assert!(report.is_ok(), "issues: {:?}", report.issues);
}

#[test]
fn overwrite_then_defrag_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let mut bc = create(&dir, "ow.barecat", None);
    bc.put("config.json", b"{\"v\": 1}", false).unwrap();
    bc.put("blob", &[7u8; 500], false).unwrap();
    bc.put("config.json", b"{\"v\": 2, \"more\": true}", true)
        .unwrap();

    assert_eq!(bc.get("config.json").unwrap(), b"{\"v\": 2, \"more\": true}");
    // the old copy is a hole now
    assert!(bc.total_physical_size() > bc.total_logical_size().unwrap());
    bc.defrag(&CancelToken::new()).unwrap();
    assert_eq!(bc.total_physical_size(), bc.total_logical_size().unwrap());
    assert_eq!(bc.get("config.json").unwrap(), b"{\"v\": 2, \"more\": true}");
    assert_eq!(bc.get("blob").unwrap(), vec![7u8; 500]);
}

#[test]
fn readers_see_archive_while_closed_writer() {
    let dir = tempfile::tempdir().unwrap();
    let base = archive_at(&dir, "shared.barecat");
    {
        let mut bc = create(&dir, "shared.barecat", None);
        bc.put("x/data.bin", &[5u8; 64], false).unwrap();
        bc.close().unwrap();
    }
    // each reader thread holds its own facade
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let base = base.clone();
            std::thread::spawn(move || {
                let bc = Barecat::open(&base).unwrap();
                assert_eq!(bc.get("x/data.bin").unwrap(), vec![5u8; 64]);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}
