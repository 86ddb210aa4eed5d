//! The user-visible archive surface.

use std::fs::{File, TryLockError};
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};

use vefs_storage::alloc::ArchiveSectorAllocator;
use vefs_storage::constants::PERSONALIZATION_AREA_SIZE;
use vefs_storage::crypto::{AesGcmProvider, CryptoProvider};
use vefs_storage::device::{
    read_archive_personalization_area, ArchiveOpening, SectorDevice,
};
use vefs_storage::error::{Error, ErrorKind, Result, ResultExt};
use vefs_storage::tree::RootSectorInfo;

use crate::vfile::VFileHandle;
use crate::vfilesystem::{FileQueryResult, OpenMode, VFilesystem};
use crate::workers::WorkerPool;

/// How [`Archive::open`] treats the host file.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CreationMode {
    OpenExisting,
    OnlyIfNotExist,
    IfNeeded,
    AlwaysNew,
}

/// What [`Archive::purge_corruption`] does with the damaged original.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BackupMode {
    Delete,
    CloneExtents,
}

/// An open archive: the single-file virtual filesystem.
///
/// Dropping the archive finalizes the free-sector index (unless a leak was
/// detected, in which case the next open runs recovery) and drains the
/// worker pool.
pub struct Archive {
    filesystem: Arc<VFilesystem>,
    allocator: Arc<ArchiveSectorAllocator>,
    workers: Arc<WorkerPool>,
    device: Arc<SectorDevice>,
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive").finish_non_exhaustive()
    }
}

fn open_host_file(path: &Path, mode: CreationMode) -> Result<(File, bool)> {
    let mut options = File::options();
    options.read(true).write(true);

    match mode {
        CreationMode::OpenExisting => {
            let file = options.open(path).map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    Error::wrapping(
                        ErrorKind::ArchiveFileDidNotExist,
                        Error::from(err),
                    )
                } else {
                    err.into()
                }
            })?;
            if file.metadata()?.len() == 0 {
                return Err(ErrorKind::ArchiveFileDidNotExist.into());
            }
            Ok((file, false))
        }
        CreationMode::OnlyIfNotExist => {
            let file = options.create_new(true).open(path).map_err(|err| {
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::wrapping(
                        ErrorKind::ArchiveFileAlreadyExisted,
                        Error::from(err),
                    )
                } else {
                    Error::from(err)
                }
            })?;
            Ok((file, true))
        }
        CreationMode::IfNeeded => {
            let file = options.create(true).open(path)?;
            let created = file.metadata()?.len() == 0;
            Ok((file, created))
        }
        CreationMode::AlwaysNew => {
            let file = options.create(true).truncate(true).open(path)?;
            Ok((file, true))
        }
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .min(8)
}

impl Archive {
    /// Opens or creates the archive at `path` with the production AEAD.
    pub fn open(
        path: impl AsRef<Path>,
        user_prk: &[u8; 32],
        mode: CreationMode,
    ) -> Result<Archive> {
        Self::open_with_provider(path, user_prk, mode, Box::new(AesGcmProvider))
    }

    /// Like [`Archive::open`] with an explicit crypto provider.
    pub fn open_with_provider(
        path: impl AsRef<Path>,
        user_prk: &[u8; 32],
        mode: CreationMode,
        provider: Box<dyn CryptoProvider>,
    ) -> Result<Archive> {
        info!("open_archive:start");
        let (file, created) = open_host_file(path.as_ref(), mode)?;
        let archive = if created {
            Self::create_new(file, user_prk, provider)
        } else {
            Self::open_existing(file, user_prk, provider)
        };
        info!("open_archive:finish");
        archive
    }

    fn create_new(
        file: File,
        user_prk: &[u8; 32],
        provider: Box<dyn CryptoProvider>,
    ) -> Result<Archive> {
        let ArchiveOpening {
            device,
            directory,
            free_sector_index,
        } = SectorDevice::create_new(file, provider, user_prk)?;
        let device = Arc::new(device);

        let allocator = Arc::new(ArchiveSectorAllocator::new(
            Arc::clone(&device),
            free_sector_index.crypto_ctx,
        ));
        allocator
            .initialize_new()
            .with_file_path("[free-block-list]")?;
        let workers = Arc::new(WorkerPool::new(default_worker_count()));

        let filesystem = VFilesystem::create_new(
            Arc::clone(&device),
            Arc::clone(&allocator),
            Arc::clone(&workers),
            directory,
        )
        .with_file_path("[archive-index]")?;

        Ok(Archive {
            filesystem,
            allocator,
            workers,
            device,
        })
    }

    fn open_existing(
        file: File,
        user_prk: &[u8; 32],
        provider: Box<dyn CryptoProvider>,
    ) -> Result<Archive> {
        let ArchiveOpening {
            device,
            directory,
            free_sector_index,
        } = SectorDevice::open_existing(file, provider, user_prk)?;
        let device = Arc::new(device);

        let allocator = Arc::new(ArchiveSectorAllocator::new(
            Arc::clone(&device),
            free_sector_index.crypto_ctx,
        ));
        let workers = Arc::new(WorkerPool::new(default_worker_count()));

        let filesystem = VFilesystem::open_existing(
            Arc::clone(&device),
            Arc::clone(&allocator),
            Arc::clone(&workers),
            directory,
        )
        .with_file_path("[archive-index]")?;

        if free_sector_index.tree_info.root.is_unallocated() {
            // the previous session did not finalize; rebuild the pool
            warn!("free-sector index is missing, running recovery");
            filesystem.recover_unused_sectors()?;
        } else {
            allocator
                .initialize_from(free_sector_index.tree_info)
                .with_file_path("[free-block-list]")?;
            // clear the stored free-list root: a crashed session must
            // trigger recovery on the next open
            device.update_header(
                filesystem.crypto_ctx(),
                filesystem.committed_root(),
                allocator.crypto_ctx(),
                RootSectorInfo::default(),
            )?;
        }

        Ok(Archive {
            filesystem,
            allocator,
            workers,
            device,
        })
    }

    /// Opens (or creates) a virtual file inside the archive.
    pub fn open_file(
        &self,
        path: &str,
        mode: OpenMode,
    ) -> Result<VFileHandle> {
        self.filesystem.open(path, mode)
    }

    pub fn query(&self, path: &str) -> Result<FileQueryResult> {
        self.filesystem.query(path)
    }

    /// Removes a virtual file; fails with `still_in_use` while any handle
    /// to it is alive.
    pub fn erase(&self, path: &str) -> Result<()> {
        self.filesystem.erase(path)
    }

    pub fn read(
        &self,
        handle: &VFileHandle,
        buffer: &mut [u8],
        offset: u64,
    ) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let extent = handle.maximum_extent();
        let end = offset.saturating_add(buffer.len() as u64);
        if end > extent {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_file_id(handle.id())
                .with_span(offset..end));
        }
        handle.read(buffer, offset)
    }

    pub fn write(
        &self,
        handle: &VFileHandle,
        data: &[u8],
        offset: u64,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        handle.write(data, offset)
    }

    pub fn truncate(&self, handle: &VFileHandle, size: u64) -> Result<()> {
        handle.truncate(size)
    }

    pub fn maximum_extent_of(&self, handle: &VFileHandle) -> u64 {
        handle.maximum_extent()
    }

    /// Commits every dirty open file and the directory.
    pub fn commit(&self) -> Result<()> {
        info!("commit:start");
        self.filesystem.commit_open_files()?;
        let result = self.filesystem.commit();
        info!("commit:finish");
        result
    }

    /// Commits a single file (and, through it, the directory).
    pub fn commit_file(&self, handle: &VFileHandle) -> Result<()> {
        handle.commit()
    }

    pub fn list_files(&self) -> Vec<String> {
        self.filesystem.list_files()
    }

    pub fn extract(
        &self,
        source_path: &str,
        target_base: impl AsRef<Path>,
    ) -> Result<()> {
        info!("extract:start");
        let result = self
            .filesystem
            .extract(source_path, target_base.as_ref());
        info!("extract:finish");
        result
    }

    pub fn extract_all(&self, target_base: impl AsRef<Path>) -> Result<()> {
        info!("extract_all:start");
        let result = self.filesystem.extract_all(target_base.as_ref());
        info!("extract_all:finish");
        result
    }

    /// Reseals the static header under a new user key.
    pub fn change_user_prk(&self, new_user_prk: &[u8; 32]) -> Result<()> {
        self.device.update_static_header(
            new_user_prk,
            self.filesystem.crypto_ctx(),
            self.filesystem.committed_root(),
            self.allocator.crypto_ctx(),
            RootSectorInfo::default(),
        )
    }

    /// Scans every file for unreadable sectors without modifying anything.
    pub fn validate_open(&self) -> Result<()> {
        self.filesystem.validate()
    }

    /// Runs a closure over the plaintext personalization area.
    pub fn with_personalization_area<R>(
        &self,
        f: impl FnOnce(&mut [u8; PERSONALIZATION_AREA_SIZE]) -> R,
    ) -> R {
        f(&mut self.device.personalization_area())
    }

    pub fn sync_personalization_area(&self) -> Result<()> {
        self.device.sync_personalization_area()
    }

    /// Checks that every sector of every file decrypts, without opening a
    /// writable session.
    pub fn validate(
        path: impl AsRef<Path>,
        user_prk: &[u8; 32],
    ) -> Result<()> {
        info!("validate:start");
        let file = File::options()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let ArchiveOpening {
            device, directory, free_sector_index, ..
        } = SectorDevice::open_existing(
            file,
            Box::new(AesGcmProvider),
            user_prk,
        )?;
        let device = Arc::new(device);
        let allocator = Arc::new(ArchiveSectorAllocator::new(
            Arc::clone(&device),
            free_sector_index.crypto_ctx,
        ));
        let workers = Arc::new(WorkerPool::new(1));
        let filesystem = VFilesystem::open_existing(
            device,
            allocator,
            workers,
            directory,
        )?;
        let result = filesystem.validate();
        info!("validate:finish");
        result
    }

    /// Repairs an archive with damaged sectors by healing a working copy
    /// and swapping it into place; the original is kept as `<path>.bak`
    /// when `backup_mode` asks for it.
    pub fn purge_corruption(
        path: impl AsRef<Path>,
        user_prk: &[u8; 32],
        backup_mode: BackupMode,
    ) -> Result<()> {
        info!("purge_corruption:start");
        let path = path.as_ref();

        // hold the advisory lock on the damaged original throughout
        let original = File::options().read(true).write(true).open(path)?;
        match original.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(ErrorKind::StillInUse.into());
            }
            Err(TryLockError::Error(err)) => return Err(err.into()),
        }

        let mut disambiguator = [0u8; 8];
        AesGcmProvider.random_bytes(&mut disambiguator)?;
        let working_path = path.with_file_name(format!(
            "{}.{}.tmp",
            path.file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("archive"),
            hex::encode(disambiguator),
        ));
        let backup_path = path.with_file_name(format!(
            "{}.bak",
            path.file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("archive"),
        ));

        std::fs::copy(path, &working_path)?;
        let purge = (|| -> Result<()> {
            let working = File::options()
                .read(true)
                .write(true)
                .open(&working_path)?;
            let archive = Self::open_existing(
                working,
                user_prk,
                Box::new(AesGcmProvider),
            )?;
            archive.filesystem.replace_corrupted_sectors()?;
            archive.filesystem.recover_unused_sectors()?;
            drop(archive);
            Ok(())
        })();

        if let Err(err) = purge {
            let _ = std::fs::remove_file(&working_path);
            return Err(err);
        }

        match backup_mode {
            BackupMode::CloneExtents => {
                std::fs::rename(path, &backup_path)?;
            }
            BackupMode::Delete => {
                std::fs::remove_file(path)?;
            }
        }
        std::fs::rename(&working_path, path)?;
        info!("purge_corruption:finish");
        Ok(())
    }

    /// Reads the personalization area without unlocking the archive.
    pub fn read_personalization_area(
        path: impl AsRef<Path>,
        out: &mut [u8; PERSONALIZATION_AREA_SIZE],
    ) -> Result<()> {
        let file = File::open(path.as_ref())?;
        read_archive_personalization_area(&file, out)
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        self.workers.wait();
        if self.allocator.sector_leak_detected() {
            warn!("sectors leaked this session; skipping finalization");
            return;
        }
        if let Err(err) = self.allocator.finalize(
            self.filesystem.crypto_ctx(),
            self.filesystem.committed_root(),
        ) {
            warn!("failed to finalize the free-sector index: {err}");
        }
    }
}
