use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::Result;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use tempfile::{tempdir, TempDir};

use vefs::{
    Archive, BackupMode, CreationMode, ErrorKind, OpenMode, SECTOR_SIZE,
};

const TEST_SEED: [u8; 16] = [
    0x59, 0x62, 0xbe, 0x5d, 0x76, 0x3d, 0x31, 0x8d, 0x17, 0xdb, 0x37, 0x32,
    0x54, 0x06, 0xbc, 0xe5,
];

const USER_PRK: [u8; 32] = [0x2a; 32];

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn archive_path(dir: &TempDir) -> PathBuf {
    dir.path().join("test.vefs")
}

#[test]
fn create_write_small_and_reopen() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);

    {
        let archive =
            Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
        let file = archive.open_file(
            "doc",
            OpenMode::read_write() | OpenMode::CREATE,
        )?;
        archive.write(&file, &[0x01, 0x02, 0x03, 0x04, 0x05], 0)?;
        archive.commit()?;
    }

    let archive = Archive::open(&path, &USER_PRK, CreationMode::OpenExisting)?;
    let file = archive.open_file("doc", OpenMode::READ)?;
    let mut recovered = [0u8; 5];
    archive.read(&file, &mut recovered, 0)?;
    assert_eq!(recovered, [0x01, 0x02, 0x03, 0x04, 0x05]);
    assert_eq!(archive.query("doc")?.size, 5);
    Ok(())
}

#[test]
fn writes_spanning_sector_boundaries_round_trip() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);

    let payload = vec![0xffu8; 40_000];
    {
        let archive =
            Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
        let file = archive.open_file(
            "spanning",
            OpenMode::read_write() | OpenMode::CREATE,
        )?;
        archive.write(&file, &payload, 0)?;
        archive.commit()?;
    }

    let host_size = std::fs::metadata(&path)?.len();
    assert_eq!(host_size % SECTOR_SIZE as u64, 0);
    assert!(host_size / SECTOR_SIZE as u64 <= 16);

    let archive = Archive::open(&path, &USER_PRK, CreationMode::OpenExisting)?;
    let file = archive.open_file("spanning", OpenMode::READ)?;
    let mut recovered = vec![0u8; payload.len()];
    archive.read(&file, &mut recovered, 0)?;
    assert_eq!(recovered, payload);
    Ok(())
}

#[test]
fn random_offsets_round_trip() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);
    let mut rng = XorShiftRng::from_seed(TEST_SEED);

    let mut expected = vec![0u8; 150_000];
    {
        let archive =
            Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
        let file = archive.open_file(
            "random",
            OpenMode::read_write() | OpenMode::CREATE,
        )?;
        archive.write(&file, &vec![0u8; expected.len()], 0)?;

        for _ in 0..32 {
            let offset = rng.gen_range(0..expected.len() - 4096);
            let len = rng.gen_range(1..4096usize);
            let mut chunk = vec![0u8; len];
            rng.fill(chunk.as_mut_slice());

            expected[offset..offset + len].copy_from_slice(&chunk);
            archive.write(&file, &chunk, offset as u64)?;
        }
        archive.commit()?;
    }

    let archive = Archive::open(&path, &USER_PRK, CreationMode::OpenExisting)?;
    let file = archive.open_file("random", OpenMode::READ)?;
    let mut recovered = vec![0u8; expected.len()];
    archive.read(&file, &mut recovered, 0)?;
    assert_eq!(recovered, expected);
    Ok(())
}

#[test]
fn wrong_user_prk_is_rejected() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);

    {
        let archive =
            Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
        let file = archive.open_file(
            "secret",
            OpenMode::read_write() | OpenMode::CREATE,
        )?;
        archive.write(&file, b"classified", 0)?;
        archive.commit()?;
    }

    let wrong_prk = [0x77u8; 32];
    let err = Archive::open(&path, &wrong_prk, CreationMode::OpenExisting)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WrongUserPrk);
    Ok(())
}

#[test]
fn creation_mode_mismatches_are_reported() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);

    let err = Archive::open(&path, &USER_PRK, CreationMode::OpenExisting)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArchiveFileDidNotExist);

    drop(Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?);
    let err = Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArchiveFileAlreadyExisted);
    Ok(())
}

#[test]
fn erase_fails_while_a_handle_is_alive() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);

    let archive =
        Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
    let file = archive.open_file(
        "busy",
        OpenMode::read_write() | OpenMode::CREATE,
    )?;
    archive.write(&file, b"held open", 0)?;
    archive.commit()?;

    let err = archive.erase("busy").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StillInUse);

    drop(file);
    archive.erase("busy")?;
    let err = archive.query("busy").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchVFile);

    let err = archive.erase("busy").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchVFile);
    Ok(())
}

#[test]
fn empty_writes_do_not_dirty_the_file() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);

    let archive =
        Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
    let file = archive.open_file(
        "untouched",
        OpenMode::read_write() | OpenMode::CREATE,
    )?;
    archive.commit()?;
    assert!(!file.is_dirty());

    archive.write(&file, &[], 17)?;
    assert!(!file.is_dirty());
    assert_eq!(archive.maximum_extent_of(&file), 0);
    Ok(())
}

#[test]
fn truncate_boundaries() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);

    let archive =
        Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
    let file = archive.open_file(
        "trunc",
        OpenMode::read_write() | OpenMode::CREATE,
    )?;
    archive.write(&file, &vec![0x11u8; 100_000], 0)?;
    archive.commit()?;

    // truncating to the current extent is a no-op
    assert!(!file.is_dirty());
    archive.truncate(&file, 100_000)?;
    assert!(!file.is_dirty());

    // shrink to zero, then verify a fresh write starts from empty
    archive.truncate(&file, 0)?;
    assert_eq!(archive.maximum_extent_of(&file), 0);
    archive.write(&file, b"anew", 0)?;
    archive.commit()?;

    let mut recovered = [0u8; 4];
    archive.read(&file, &mut recovered, 0)?;
    assert_eq!(&recovered, b"anew");
    Ok(())
}

#[test]
fn reads_past_the_extent_fail() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);

    let archive =
        Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
    let file = archive.open_file(
        "short",
        OpenMode::read_write() | OpenMode::CREATE,
    )?;
    archive.write(&file, b"tiny", 0)?;

    let mut buffer = [0u8; 8];
    let err = archive.read(&file, &mut buffer, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    Ok(())
}

#[test]
fn extents_survive_reopen_after_sparse_truncate() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);

    {
        let archive =
            Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
        let file = archive.open_file(
            "sized",
            OpenMode::read_write() | OpenMode::CREATE,
        )?;
        archive.truncate(&file, 0xffff)?;
        archive.commit_file(&file)?;
    }

    let archive = Archive::open(&path, &USER_PRK, CreationMode::OpenExisting)?;
    assert_eq!(archive.query("sized")?.size, 0xffff);

    let file = archive.open_file("sized", OpenMode::READ)?;
    let mut tail = [0xaau8; 16];
    archive.read(&file, &mut tail, 0xffff - 16)?;
    assert_eq!(tail, [0u8; 16]);
    Ok(())
}

#[test]
fn multiple_files_keep_their_contents_apart() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);
    let mut rng = XorShiftRng::from_seed(TEST_SEED);

    let names: Vec<String> =
        (0..12).map(|i| format!("dir/file-{i:02}")).collect();
    let mut contents = Vec::new();

    {
        let archive =
            Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
        for name in &names {
            let len = rng.gen_range(1..100_000usize);
            let mut data = vec![0u8; len];
            rng.fill(data.as_mut_slice());

            let file = archive.open_file(
                name,
                OpenMode::read_write() | OpenMode::CREATE,
            )?;
            archive.write(&file, &data, 0)?;
            contents.push(data);
        }
        archive.commit()?;
    }

    let archive = Archive::open(&path, &USER_PRK, CreationMode::OpenExisting)?;
    let mut listed = archive.list_files();
    listed.sort();
    assert_eq!(listed, names);

    for (name, expected) in names.iter().zip(&contents) {
        let file = archive.open_file(name, OpenMode::READ)?;
        let mut recovered = vec![0u8; expected.len()];
        archive.read(&file, &mut recovered, 0)?;
        assert_eq!(&recovered, expected, "mismatch in {name}");
    }
    Ok(())
}

#[test]
fn erased_files_free_their_sectors_for_reuse() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);

    {
        let archive =
            Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
        let file = archive.open_file(
            "big",
            OpenMode::read_write() | OpenMode::CREATE,
        )?;
        archive.write(&file, &vec![0x5au8; 500_000], 0)?;
        archive.commit()?;
        drop(file);
        archive.erase("big")?;
    }
    let size_after_erase = std::fs::metadata(&path)?.len();

    {
        let archive =
            Archive::open(&path, &USER_PRK, CreationMode::OpenExisting)?;
        let file = archive.open_file(
            "replacement",
            OpenMode::read_write() | OpenMode::CREATE,
        )?;
        archive.write(&file, &vec![0xa5u8; 400_000], 0)?;
        archive.commit()?;
    }

    // the replacement reuses the erased file's sectors instead of growing
    let size_after_rewrite = std::fs::metadata(&path)?.len();
    assert!(
        size_after_rewrite <= size_after_erase + SECTOR_SIZE as u64,
        "rewrite grew the archive from {size_after_erase} to {size_after_rewrite}"
    );
    Ok(())
}

#[test]
fn recovery_reclaims_sectors_after_an_unfinalized_session() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);

    {
        let archive =
            Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
        let file = archive.open_file(
            "keeper",
            OpenMode::read_write() | OpenMode::CREATE,
        )?;
        archive.truncate(&file, 0xffff)?;
        archive.commit()?;
    }

    // opening clears the stored free-list root; snapshotting the host file
    // mid-session captures exactly the state a crash would leave behind
    let crash_path = dir.path().join("crashed.vefs");
    {
        let archive =
            Archive::open(&path, &USER_PRK, CreationMode::OpenExisting)?;
        std::fs::copy(&path, &crash_path)?;
        drop(archive);
    }

    // the next open finds no free-sector index and recovers
    let archive =
        Archive::open(&crash_path, &USER_PRK, CreationMode::OpenExisting)?;
    let file = archive.open_file("keeper", OpenMode::READ)?;
    assert_eq!(archive.maximum_extent_of(&file), 0xffff);

    // recovered pool serves writes without unbounded growth
    drop(file);
    let scratch = archive.open_file(
        "scratch",
        OpenMode::read_write() | OpenMode::CREATE,
    )?;
    archive.write(&scratch, &vec![1u8; 32_000], 0)?;
    archive.commit()?;
    Ok(())
}

#[test]
fn corruption_purge_heals_damaged_sectors() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);

    {
        let archive =
            Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
        let file = archive.open_file(
            "victim",
            OpenMode::read_write() | OpenMode::CREATE,
        )?;
        archive.write(&file, &vec![0x53u8; 120_000], 0)?;
        archive.commit()?;
    }

    // smash 64 bytes in the middle of a payload sector
    {
        let mut host = OpenOptions::new().read(true).write(true).open(&path)?;
        host.seek(SeekFrom::Start(3 * SECTOR_SIZE as u64 + 64))?;
        host.write_all(&[0u8; 64])?;
    }

    // the damage is visible as a tag mismatch
    {
        let archive =
            Archive::open(&path, &USER_PRK, CreationMode::OpenExisting)?;
        let mut buffer = vec![0u8; 120_000];
        let err = match archive.open_file("victim", OpenMode::READ) {
            Ok(file) => archive.read(&file, &mut buffer, 0).unwrap_err(),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::TagMismatch);
    }

    Archive::purge_corruption(&path, &USER_PRK, BackupMode::CloneExtents)?;

    // a backup of the damaged original sits beside the archive
    let backup = dir.path().join("test.vefs.bak");
    assert!(backup.exists());

    // the healed archive opens and every sector decrypts again
    Archive::validate(&path, &USER_PRK)?;
    let archive = Archive::open(&path, &USER_PRK, CreationMode::OpenExisting)?;
    let file = archive.open_file("victim", OpenMode::READ)?;
    let mut buffer = vec![0u8; 120_000];
    archive.read(&file, &mut buffer, 0)?;
    Ok(())
}

#[test]
fn extract_writes_decrypted_copies() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);
    let target = dir.path().join("out");

    let payload = b"extract me please".to_vec();
    let archive =
        Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
    let file = archive.open_file(
        "exports/data.bin",
        OpenMode::read_write() | OpenMode::CREATE,
    )?;
    archive.write(&file, &payload, 0)?;
    archive.commit()?;
    drop(file);

    archive.extract_all(&target)?;

    let mut recovered = Vec::new();
    std::fs::File::open(target.join("exports/data.bin"))?
        .read_to_end(&mut recovered)?;
    assert_eq!(recovered, payload);
    Ok(())
}

#[test]
fn personalization_area_round_trips() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);

    {
        let archive =
            Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
        archive.with_personalization_area(|area| {
            area[..11].copy_from_slice(b"host-app-v1");
        });
        archive.sync_personalization_area()?;
        archive.commit()?;
    }

    let mut area = [0u8; 4096];
    Archive::read_personalization_area(&path, &mut area)?;
    assert_eq!(&area[..11], b"host-app-v1");
    Ok(())
}

#[test]
fn changing_the_user_prk_keeps_the_data() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);
    let new_prk = [0x99u8; 32];

    {
        let archive =
            Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
        let file = archive.open_file(
            "rekeyed",
            OpenMode::read_write() | OpenMode::CREATE,
        )?;
        archive.write(&file, b"still here", 0)?;
        archive.commit()?;
        archive.change_user_prk(&new_prk)?;
    }

    let err =
        Archive::open(&path, &USER_PRK, CreationMode::OpenExisting).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WrongUserPrk);

    let archive = Archive::open(&path, &new_prk, CreationMode::OpenExisting)?;
    let file = archive.open_file("rekeyed", OpenMode::READ)?;
    let mut recovered = [0u8; 10];
    archive.read(&file, &mut recovered, 0)?;
    assert_eq!(&recovered, b"still here");
    Ok(())
}

#[test]
fn a_second_open_of_the_same_archive_is_rejected() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = archive_path(&dir);

    let _archive =
        Archive::open(&path, &USER_PRK, CreationMode::OnlyIfNotExist)?;
    let err = Archive::open(&path, &USER_PRK, CreationMode::OpenExisting)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StillInUse);
    Ok(())
}
