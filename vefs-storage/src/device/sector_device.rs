//! Host-file ownership, archive headers and sealed-sector I/O.

use std::fs::{File, TryLockError};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info};
use parking_lot::{Mutex, MutexGuard, RwLock};
use positioned_io::ReadAt;

use crate::constants::{
    ARCHIVE_HEADER_OFFSET, ARCHIVE_HEADER_SIZE, ARCHIVE_MAGIC, KEY_NONCE_SIZE,
    MAC_SIZE, PERSONALIZATION_AREA_SIZE, SECTOR_PAYLOAD_SIZE,
    SECTOR_SALT_SIZE, SECTOR_SIZE,
};
use crate::crypto::{
    ct_compare, domains, kdf, AtomicCounter, Counter, CryptoProvider,
    FileCryptoCtx,
};
use crate::device::header::{
    self, ArchiveHeader, MasterFileRecord, StaticHeader,
};
use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::id::SectorId;
use crate::tree::RootSectorInfo;
use crate::util::SecretBytes;

/// Ids beyond this would overflow the byte-offset computation.
const SECTOR_ID_LIMIT: u64 = u64::MAX / SECTOR_SIZE as u64;

/// Unencrypted prefix of an archive header slot: salt, mac, length.
const SLOT_PREFIX_SIZE: usize = SECTOR_SALT_SIZE + MAC_SIZE + 4;

/// Unencrypted prefix of the static header: magic, salt, mac, length.
const STATIC_PREFIX_SIZE: usize = 4 + SECTOR_SALT_SIZE + MAC_SIZE + 4;

/// Crypto context and tree root of one archive-internal file as recovered
/// from (or destined for) the rotating header.
pub struct MasterFileInfo {
    pub crypto_ctx: FileCryptoCtx,
    pub tree_info: RootSectorInfo,
}

/// Everything [`SectorDevice::open_existing`] / [`SectorDevice::create_new`]
/// recover from the master sector.
pub struct ArchiveOpening {
    pub device: SectorDevice,
    pub directory: MasterFileInfo,
    pub free_sector_index: MasterFileInfo,
}

impl std::fmt::Debug for ArchiveOpening {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveOpening").finish_non_exhaustive()
    }
}

/// Owns the host file and the master secret; seals and opens sectors.
///
/// All sector I/O takes the size lock shared, `resize` takes it exclusive,
/// so the file never shrinks under an in-flight read.
pub struct SectorDevice {
    crypto: Box<dyn CryptoProvider>,
    file: File,

    size_sync: RwLock<()>,
    num_sectors: AtomicU64,

    master_secret: SecretBytes<64>,
    static_header_write_counter: Mutex<Counter>,
    session_salt: [u8; 16],
    archive_secret_counter: AtomicCounter,
    journal_counter: AtomicCounter,
    erase_counter: AtomicU64,

    // false = slot 0 active, true = slot 1 active
    active_slot: Mutex<bool>,

    personalization: Mutex<Box<[u8; PERSONALIZATION_AREA_SIZE]>>,
}

impl SectorDevice {
    fn lock_host_file(file: &File) -> Result<()> {
        match file.try_lock() {
            Ok(()) => Ok(()),
            Err(TryLockError::WouldBlock) => {
                Err(ErrorKind::StillInUse.into())
            }
            Err(TryLockError::Error(err)) => Err(err.into()),
        }
    }

    fn new(
        file: File,
        crypto: Box<dyn CryptoProvider>,
        num_sectors: u64,
    ) -> Result<Self> {
        let mut session_salt = [0u8; 16];
        crypto.random_bytes(&mut session_salt)?;

        Ok(SectorDevice {
            crypto,
            file,
            size_sync: RwLock::new(()),
            num_sectors: AtomicU64::new(num_sectors),
            master_secret: SecretBytes::zeroed(),
            static_header_write_counter: Mutex::new(Counter::ZERO),
            session_salt,
            archive_secret_counter: AtomicCounter::default(),
            journal_counter: AtomicCounter::default(),
            erase_counter: AtomicU64::new(0),
            active_slot: Mutex::new(false),
            personalization: Mutex::new(Box::new(
                [0u8; PERSONALIZATION_AREA_SIZE],
            )),
        })
    }

    /// Initializes a fresh archive in `file`: one master sector, new master
    /// secret, static header sealed under `user_prk`, and secrets for the
    /// two archive-internal files.
    pub fn create_new(
        file: File,
        crypto: Box<dyn CryptoProvider>,
        user_prk: &[u8; 32],
    ) -> Result<ArchiveOpening> {
        Self::lock_host_file(&file)?;

        let mut device = Self::new(file, crypto, 0)?;
        device.resize(1)?;

        device.crypto.random_bytes(&mut *device.master_secret)?;
        let mut counter_seed = [0u8; 16];
        device.crypto.random_bytes(&mut counter_seed)?;
        *device.static_header_write_counter.get_mut() =
            Counter::from_le_bytes(counter_seed);

        kdf(
            &mut counter_seed,
            &*device.master_secret,
            &[domains::ARCHIVE_SECRET_COUNTER_SEED, &device.session_salt],
        )?;
        device
            .archive_secret_counter
            .store(Counter::from_le_bytes(counter_seed));
        kdf(
            &mut counter_seed,
            &*device.master_secret,
            &[domains::JOURNAL_COUNTER_SEED, &device.session_salt],
        )?;
        device
            .journal_counter
            .store(Counter::from_le_bytes(counter_seed));

        device.write_static_header(user_prk)?;

        let directory = MasterFileInfo {
            crypto_ctx: device.create_file_secrets()?,
            tree_info: RootSectorInfo::default(),
        };
        let free_sector_index = MasterFileInfo {
            crypto_ctx: device.create_file_secrets()?,
            tree_info: RootSectorInfo::default(),
        };

        info!("created archive container with a fresh master secret");
        Ok(ArchiveOpening {
            device,
            directory,
            free_sector_index,
        })
    }

    /// Opens an existing archive, recovering the master secret through
    /// `user_prk` and selecting the newer of the two header slots.
    pub fn open_existing(
        file: File,
        crypto: Box<dyn CryptoProvider>,
        user_prk: &[u8; 32],
    ) -> Result<ArchiveOpening> {
        Self::lock_host_file(&file)?;

        let max_extent = file.metadata()?.len();
        let num_sectors = max_extent / SECTOR_SIZE as u64;
        if num_sectors < 1 {
            return Err(ErrorKind::NoArchiveHeader.into());
        }

        let mut device = Self::new(file, crypto, num_sectors)?;
        device
            .parse_static_header(user_prk)
            .with_sector(SectorId::MASTER)?;
        let (directory, free_sector_index) = device
            .parse_archive_header()
            .with_sector(SectorId::MASTER)?;

        {
            let mut personalization = device.personalization.lock();
            device.read_exact_at(
                (SECTOR_SIZE - PERSONALIZATION_AREA_SIZE) as u64,
                &mut **personalization,
            )?;
        }

        Ok(ArchiveOpening {
            device,
            directory,
            free_sector_index,
        })
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(offset, buf).map_err(Into::into)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset).map_err(Into::into)
    }

    fn parse_static_header(&mut self, user_prk: &[u8; 32]) -> Result<()> {
        let mut prefix = [0u8; STATIC_PREFIX_SIZE];
        // a host file too short for the prefix is not an archive at all
        self.read_exact_at(0, &mut prefix)
            .map_err(|err| Error::wrapping(ErrorKind::InvalidPrefix, err))?;

        if prefix[..4] != ARCHIVE_MAGIC {
            return Err(ErrorKind::InvalidPrefix.into());
        }
        let salt = &prefix[4..36];
        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&prefix[36..52]);
        let length =
            u32::from_le_bytes(prefix[52..56].try_into().unwrap()) as usize;
        if length > ARCHIVE_HEADER_OFFSET - STATIC_PREFIX_SIZE {
            return Err(ErrorKind::OversizedStaticHeader.into());
        }

        let mut ciphertext = vec![0u8; length];
        self.read_exact_at(STATIC_PREFIX_SIZE as u64, &mut ciphertext)?;

        let mut key_nonce = SecretBytes::<KEY_NONCE_SIZE>::zeroed();
        kdf(&mut *key_nonce, user_prk, &[salt])?;
        self.crypto
            .open_in_place(&mut ciphertext, &key_nonce, &mac)
            .map_err(|err| {
                if err.kind() == ErrorKind::TagMismatch {
                    Error::wrapping(ErrorKind::WrongUserPrk, err)
                } else {
                    err
                }
            })?;

        let parsed = header::decode_static_header(&ciphertext)?;
        self.master_secret.copy_from_slice(&parsed.master_secret);
        *self.static_header_write_counter.get_mut() = parsed.write_counter;
        Ok(())
    }

    fn slot_offset(slot: bool) -> u64 {
        (ARCHIVE_HEADER_OFFSET + usize::from(slot) * ARCHIVE_HEADER_SIZE)
            as u64
    }

    fn parse_archive_header_slot(&self, slot: bool) -> Result<ArchiveHeader> {
        let mut raw = vec![0u8; ARCHIVE_HEADER_SIZE];
        self.read_exact_at(Self::slot_offset(slot), &mut raw)?;

        let salt = &raw[..SECTOR_SALT_SIZE];
        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&raw[SECTOR_SALT_SIZE..SECTOR_SALT_SIZE + MAC_SIZE]);
        let length = u32::from_le_bytes(
            raw[SLOT_PREFIX_SIZE - 4..SLOT_PREFIX_SIZE].try_into().unwrap(),
        ) as usize;
        if length > ARCHIVE_HEADER_SIZE - SLOT_PREFIX_SIZE {
            return Err(ErrorKind::OversizedStaticHeader.into());
        }

        let mut key_nonce = SecretBytes::<KEY_NONCE_SIZE>::zeroed();
        kdf(
            &mut *key_nonce,
            &*self.master_secret,
            &[domains::ARCHIVE_HEADER_PRK, salt],
        )?;

        let mut ciphertext =
            raw[SLOT_PREFIX_SIZE..SLOT_PREFIX_SIZE + length].to_vec();
        self.crypto.open_in_place(&mut ciphertext, &key_nonce, &mac)?;

        header::decode_archive_header(&ciphertext)
    }

    fn parse_archive_header(
        &mut self,
    ) -> Result<(MasterFileInfo, MasterFileInfo)> {
        let first = self.parse_archive_header_slot(false);
        let second = self.parse_archive_header_slot(true);

        let (selected, header) = match (first, second) {
            (Ok(first), Ok(second)) => {
                let lhs = first.secret_counter.to_le_bytes();
                let rhs = second.secret_counter.to_le_bytes();
                match ct_compare(&lhs, &rhs) {
                    std::cmp::Ordering::Equal => {
                        // cannot be produced by a conforming writer
                        return Err(ErrorKind::IdenticalHeaderVersion.into());
                    }
                    std::cmp::Ordering::Greater => (false, first),
                    std::cmp::Ordering::Less => (true, second),
                }
            }
            (Ok(first), Err(_)) => (false, first),
            (Err(_), Ok(second)) => (true, second),
            (Err(first_err), Err(_)) => {
                return Err(Error::wrapping(
                    ErrorKind::NoArchiveHeader,
                    first_err,
                ));
            }
        };

        *self.active_slot.get_mut() = selected;
        self.archive_secret_counter.store(header.secret_counter);
        self.journal_counter.store(header.journal_counter);

        let unpack = |record: MasterFileRecord| MasterFileInfo {
            crypto_ctx: FileCryptoCtx::new(record.secret, record.counter),
            tree_info: record.tree_info,
        };
        Ok((unpack(header.directory), unpack(header.free_sector_index)))
    }

    fn write_static_header(&self, user_prk: &[u8; 32]) -> Result<()> {
        let write_counter = {
            let mut guard = self.static_header_write_counter.lock();
            *guard = guard.incremented();
            *guard
        };

        let mut salt = [0u8; SECTOR_SALT_SIZE];
        kdf(
            &mut salt,
            &write_counter.to_le_bytes(),
            &[domains::STATIC_HEADER_SALT, &self.session_salt],
        )?;

        let mut message = header::encode_static_header(&StaticHeader {
            master_secret: *self.master_secret,
            write_counter,
        })?;
        if message.len() > ARCHIVE_HEADER_OFFSET - STATIC_PREFIX_SIZE {
            return Err(ErrorKind::OversizedStaticHeader.into());
        }

        let mut key_nonce = SecretBytes::<KEY_NONCE_SIZE>::zeroed();
        kdf(&mut *key_nonce, user_prk, &[&salt])?;

        let mut mac = [0u8; MAC_SIZE];
        self.crypto.seal_in_place(&mut message, &mut mac, &key_nonce)?;

        let mut prefix = [0u8; STATIC_PREFIX_SIZE];
        prefix[..4].copy_from_slice(&ARCHIVE_MAGIC);
        prefix[4..36].copy_from_slice(&salt);
        prefix[36..52].copy_from_slice(&mac);
        prefix[52..56].copy_from_slice(&(message.len() as u32).to_le_bytes());

        let _guard = self.size_sync.read();
        self.write_all_at(0, &prefix)?;
        self.write_all_at(STATIC_PREFIX_SIZE as u64, &message)?;
        Ok(())
    }

    /// Serializes the two master file records into the inactive header slot
    /// and flips the active slot. A torn write leaves the previously active
    /// slot untouched and therefore selectable on the next open.
    pub fn update_header(
        &self,
        directory_ctx: &FileCryptoCtx,
        directory_root: RootSectorInfo,
        free_ctx: &FileCryptoCtx,
        free_root: RootSectorInfo,
    ) -> Result<()> {
        let pack = |ctx: &FileCryptoCtx, tree_info| {
            let (secret, counter) = ctx.state();
            MasterFileRecord {
                secret,
                counter,
                tree_info,
            }
        };

        let salt_counter = self.archive_secret_counter.fetch_increment();
        let stored_counter = self.archive_secret_counter.fetch_increment();

        let message = header::encode_archive_header(&ArchiveHeader {
            directory: pack(directory_ctx, directory_root),
            free_sector_index: pack(free_ctx, free_root),
            secret_counter: stored_counter,
            journal_counter: self.journal_counter.load(),
        })?;
        if message.len() > ARCHIVE_HEADER_SIZE - SLOT_PREFIX_SIZE {
            return Err(ErrorKind::VFilesystemEntrySerializationFailed.into());
        }

        let mut slot = vec![0u8; ARCHIVE_HEADER_SIZE];
        slot[SLOT_PREFIX_SIZE..SLOT_PREFIX_SIZE + message.len()]
            .copy_from_slice(&message);

        let (salt_region, rest) = slot.split_at_mut(SECTOR_SALT_SIZE);
        kdf(
            salt_region,
            &salt_counter.to_le_bytes(),
            &[domains::ARCHIVE_HEADER_SALT, &self.session_salt],
        )?;
        let mut key_nonce = SecretBytes::<KEY_NONCE_SIZE>::zeroed();
        kdf(
            &mut *key_nonce,
            &*self.master_secret,
            &[domains::ARCHIVE_HEADER_PRK, salt_region],
        )?;

        let mut mac = [0u8; MAC_SIZE];
        let message_region = &mut rest
            [SLOT_PREFIX_SIZE - SECTOR_SALT_SIZE..]
            [..message.len()];
        self.crypto.seal_in_place(message_region, &mut mac, &key_nonce)?;
        rest[..MAC_SIZE].copy_from_slice(&mac);
        rest[MAC_SIZE..MAC_SIZE + 4]
            .copy_from_slice(&(message.len() as u32).to_le_bytes());

        let mut active = self.active_slot.lock();
        let target = !*active;
        {
            let _guard = self.size_sync.read();
            self.write_all_at(Self::slot_offset(target), &slot)
                .with_file_path("[archive-header]")?;
        }
        *active = target;
        debug!("rotated archive header into slot {}", u8::from(target));
        Ok(())
    }

    /// Reseals the static header under a new user key, then rotates the
    /// archive header once so both headers describe the same state.
    pub fn update_static_header(
        &self,
        new_user_prk: &[u8; 32],
        directory_ctx: &FileCryptoCtx,
        directory_root: RootSectorInfo,
        free_ctx: &FileCryptoCtx,
        free_root: RootSectorInfo,
    ) -> Result<()> {
        self.write_static_header(new_user_prk)?;
        self.update_header(directory_ctx, directory_root, free_ctx, free_root)
    }

    fn check_payload_id(sector: SectorId) -> Result<()> {
        if sector.is_master() || sector.get() >= SECTOR_ID_LIMIT {
            return Err(ErrorKind::InvalidArgument.into());
        }
        Ok(())
    }

    /// Reads and opens sector `sector`; `mac` comes from the parent
    /// reference (or the root record).
    pub fn read_sector(
        &self,
        content: &mut [u8],
        file_ctx: &FileCryptoCtx,
        sector: SectorId,
        mac: &[u8; MAC_SIZE],
    ) -> Result<()> {
        Self::check_payload_id(sector)?;
        if content.len() != SECTOR_PAYLOAD_SIZE {
            return Err(ErrorKind::InvalidArgument.into());
        }

        let mut raw = vec![0u8; SECTOR_SIZE];
        {
            let _guard = self.size_sync.read();
            self.read_exact_at(sector.byte_offset(), &mut raw)
                .with_sector(sector)?;
        }

        file_ctx
            .unseal_sector(content, self.crypto.as_ref(), &raw, mac)
            .with_sector(sector)
    }

    /// Seals `data` under a fresh nonce from the file's write counter and
    /// writes it to sector `sector`; the tag lands in `mac`.
    pub fn write_sector(
        &self,
        mac: &mut [u8; MAC_SIZE],
        file_ctx: &FileCryptoCtx,
        sector: SectorId,
        data: &[u8],
    ) -> Result<()> {
        Self::check_payload_id(sector)?;

        let mut raw = vec![0u8; SECTOR_SIZE];
        file_ctx
            .seal_sector(
                &mut raw,
                mac,
                self.crypto.as_ref(),
                &self.session_salt,
                data,
            )
            .with_sector(sector)?;

        let _guard = self.size_sync.read();
        self.write_all_at(sector.byte_offset(), &raw)
            .with_sector(sector)
    }

    /// Destroys the key material of a sector by overwriting its salt.
    pub fn erase_sector(&self, sector: SectorId) -> Result<()> {
        if sector.is_master() {
            return Err(ErrorKind::InvalidArgument.into());
        }
        let nonce = self.erase_counter.fetch_add(1, Ordering::Relaxed);
        let mut salt = [0u8; SECTOR_SALT_SIZE];
        kdf(
            &mut salt,
            &self.session_salt,
            &[&nonce.to_le_bytes(), domains::SECTOR_ERASE],
        )?;

        let _guard = self.size_sync.read();
        self.write_all_at(sector.byte_offset(), &salt)
            .with_sector(sector)
    }

    /// Truncates the host file to `num_sectors` sectors (master included).
    pub fn resize(&self, num_sectors: u64) -> Result<()> {
        let _guard = self.size_sync.write();
        self.file.set_len(num_sectors * SECTOR_SIZE as u64)?;
        self.num_sectors.store(num_sectors, Ordering::Release);
        Ok(())
    }

    /// Current sector count of the host file, master sector included.
    pub fn size(&self) -> u64 {
        self.num_sectors.load(Ordering::Acquire)
    }

    /// Derives a fresh secret and nonce-counter seed for a new file.
    pub fn create_file_secrets(&self) -> Result<FileCryptoCtx> {
        let counter = self.archive_secret_counter.fetch_increment();
        let mut secret = SecretBytes::<32>::zeroed();
        kdf(
            &mut *secret,
            &*self.master_secret,
            &[
                domains::FILE_SECRET_SEED,
                &counter.to_le_bytes(),
                &self.session_salt,
            ],
        )?;

        let counter = self.archive_secret_counter.fetch_increment();
        let mut counter_seed = [0u8; 16];
        kdf(
            &mut counter_seed,
            &*self.master_secret,
            &[domains::FILE_COUNTER_SEED, &counter.to_le_bytes()],
        )?;

        Ok(FileCryptoCtx::new(
            *secret,
            Counter::from_le_bytes(counter_seed),
        ))
    }

    pub fn crypto(&self) -> &dyn CryptoProvider {
        self.crypto.as_ref()
    }

    pub fn session_salt(&self) -> &[u8; 16] {
        &self.session_salt
    }

    pub fn archive_secret_counter(&self) -> &AtomicCounter {
        &self.archive_secret_counter
    }

    /// The 4 KiB plaintext scratch area within the master sector.
    pub fn personalization_area(
        &self,
    ) -> MutexGuard<'_, Box<[u8; PERSONALIZATION_AREA_SIZE]>> {
        self.personalization.lock()
    }

    /// Flushes the personalization area to the host file.
    pub fn sync_personalization_area(&self) -> Result<()> {
        let buffer = self.personalization.lock();
        let _guard = self.size_sync.read();
        self.write_all_at(
            (SECTOR_SIZE - PERSONALIZATION_AREA_SIZE) as u64,
            &**buffer,
        )
    }
}

/// Reads the personalization area of an archive without opening it.
pub fn read_archive_personalization_area(
    file: &File,
    out: &mut [u8; PERSONALIZATION_AREA_SIZE],
) -> Result<()> {
    let mut magic = [0u8; 4];
    file.read_exact_at(0, &mut magic)
        .map_err(|_| ErrorKind::InvalidPrefix)?;
    if magic != ARCHIVE_MAGIC {
        return Err(ErrorKind::InvalidPrefix.into());
    }
    file.read_exact_at(
        (SECTOR_SIZE - PERSONALIZATION_AREA_SIZE) as u64,
        out,
    )
    .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::OnlyMacProvider;

    fn temp_device() -> (tempfile::TempDir, ArchiveOpening) {
        let dir = tempfile::tempdir().unwrap();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.path().join("archive.vefs"))
            .unwrap();
        let opening = SectorDevice::create_new(
            file,
            Box::new(OnlyMacProvider),
            &[0u8; 32],
        )
        .unwrap();
        (dir, opening)
    }

    #[test]
    fn create_produces_a_single_master_sector() {
        let (_dir, opening) = temp_device();
        assert_eq!(opening.device.size(), 1);
    }

    #[test]
    fn sectors_round_trip_through_seal_and_open() {
        let (_dir, opening) = temp_device();
        let device = opening.device;
        device.resize(2).unwrap();

        let ctx = device.create_file_secrets().unwrap();
        let mut payload = vec![0u8; SECTOR_PAYLOAD_SIZE];
        payload[10] = 0xfe;

        let mut mac = [0u8; MAC_SIZE];
        device
            .write_sector(&mut mac, &ctx, SectorId::new(1), &payload)
            .unwrap();

        let mut recovered = vec![0u8; SECTOR_PAYLOAD_SIZE];
        device
            .read_sector(&mut recovered, &ctx, SectorId::new(1), &mac)
            .unwrap();
        assert_eq!(recovered, payload);
    }

    #[test]
    fn erased_sectors_no_longer_authenticate() {
        let (_dir, opening) = temp_device();
        let device = opening.device;
        device.resize(2).unwrap();

        let ctx = device.create_file_secrets().unwrap();
        let payload = vec![0x55u8; SECTOR_PAYLOAD_SIZE];
        let mut mac = [0u8; MAC_SIZE];
        device
            .write_sector(&mut mac, &ctx, SectorId::new(1), &payload)
            .unwrap();
        device.erase_sector(SectorId::new(1)).unwrap();

        let mut recovered = vec![0u8; SECTOR_PAYLOAD_SIZE];
        let err = device
            .read_sector(&mut recovered, &ctx, SectorId::new(1), &mac)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TagMismatch);
        assert_eq!(err.sector(), Some(SectorId::new(1)));
    }

    #[test]
    fn header_rotation_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.vefs");
        let root = RootSectorInfo {
            maximum_extent: 12345,
            ..RootSectorInfo::default()
        };
        {
            let file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .unwrap();
            let opening = SectorDevice::create_new(
                file,
                Box::new(OnlyMacProvider),
                &[7u8; 32],
            )
            .unwrap();
            opening
                .device
                .update_header(
                    &opening.directory.crypto_ctx,
                    root,
                    &opening.free_sector_index.crypto_ctx,
                    RootSectorInfo::default(),
                )
                .unwrap();
        }

        let file = File::options().read(true).write(true).open(&path).unwrap();
        let opening = SectorDevice::open_existing(
            file,
            Box::new(OnlyMacProvider),
            &[7u8; 32],
        )
        .unwrap();
        assert_eq!(opening.directory.tree_info.maximum_extent, 12345);
    }

    #[test]
    fn wrong_user_prk_is_reported_as_such() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.vefs");
        {
            let file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .unwrap();
            SectorDevice::create_new(file, Box::new(OnlyMacProvider), &[1; 32])
                .unwrap();
        }
        let file = File::options().read(true).write(true).open(&path).unwrap();
        let err = SectorDevice::open_existing(
            file,
            Box::new(OnlyMacProvider),
            &[2; 32],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongUserPrk);
    }
}
