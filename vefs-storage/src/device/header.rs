//! CBOR codecs for the static and rotating archive headers.
//!
//! Both headers are integer-keyed CBOR maps. Unknown keys are skipped on
//! decode; a missing required key is `invalid_proto`, a key of the wrong
//! shape `incompatible_proto`.

use ciborium::value::{Integer, Value};

use crate::crypto::Counter;
use crate::error::{ErrorKind, Result};
use crate::id::SectorId;
use crate::tree::{RootSectorInfo, SectorReference};

/// Content of the static archive header.
pub(crate) struct StaticHeader {
    pub master_secret: [u8; 64],
    pub write_counter: Counter,
}

/// Serialized state of one of the two archive-internal files.
#[derive(Clone, Copy, Default)]
pub(crate) struct MasterFileRecord {
    pub secret: [u8; 32],
    pub counter: Counter,
    pub tree_info: RootSectorInfo,
}

/// Content of a rotating archive header slot.
pub(crate) struct ArchiveHeader {
    pub directory: MasterFileRecord,
    pub free_sector_index: MasterFileRecord,
    pub secret_counter: Counter,
    pub journal_counter: Counter,
}

impl std::fmt::Debug for ArchiveHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveHeader").finish_non_exhaustive()
    }
}

const KEY_FORMAT_VERSION: u64 = 0;
const KEY_MASTER_SECRET: u64 = 1;
const KEY_WRITE_COUNTER: u64 = 2;

const KEY_DIRECTORY: u64 = 1;
const KEY_FREE_SECTOR_INDEX: u64 = 2;
const KEY_SECRET_COUNTER: u64 = 3;
const KEY_JOURNAL_COUNTER: u64 = 4;

// master file records reuse the directory descriptor key table
const KEY_SECRET: u64 = 3;
const KEY_COUNTER: u64 = 4;
const KEY_ROOT_SECTOR: u64 = 5;
const KEY_ROOT_MAC: u64 = 6;
const KEY_MAX_EXTENT: u64 = 7;
const KEY_TREE_DEPTH: u64 = 8;

fn key(raw: u64) -> Value {
    Value::Integer(Integer::from(raw))
}

pub(crate) fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(value, &mut buffer)
        .map_err(|_| ErrorKind::VFilesystemEntrySerializationFailed)?;
    Ok(buffer)
}

pub(crate) fn decode(raw: &[u8]) -> Result<Value> {
    ciborium::de::from_reader(raw).map_err(|_| ErrorKind::InvalidProto.into())
}

pub(crate) fn map_entries(value: &Value) -> Result<&[(Value, Value)]> {
    match value {
        Value::Map(entries) => Ok(entries),
        _ => Err(ErrorKind::InvalidProto.into()),
    }
}

pub(crate) fn lookup<'v>(
    entries: &'v [(Value, Value)],
    wanted: u64,
) -> Option<&'v Value> {
    entries.iter().find_map(|(k, v)| match k {
        Value::Integer(i) if *i == Integer::from(wanted) => Some(v),
        _ => None,
    })
}

pub(crate) fn required<'v>(
    entries: &'v [(Value, Value)],
    wanted: u64,
) -> Result<&'v Value> {
    lookup(entries, wanted).ok_or_else(|| ErrorKind::InvalidProto.into())
}

pub(crate) fn as_bytes_exact<const N: usize>(value: &Value) -> Result<[u8; N]> {
    match value {
        Value::Bytes(raw) if raw.len() == N => {
            let mut out = [0u8; N];
            out.copy_from_slice(raw);
            Ok(out)
        }
        Value::Bytes(_) => Err(ErrorKind::IncompatibleProto.into()),
        _ => Err(ErrorKind::InvalidProto.into()),
    }
}

pub(crate) fn as_u64(value: &Value) -> Result<u64> {
    match value {
        Value::Integer(i) => {
            u64::try_from(*i).map_err(|_| ErrorKind::IncompatibleProto.into())
        }
        _ => Err(ErrorKind::InvalidProto.into()),
    }
}

fn master_file_to_value(record: &MasterFileRecord) -> Value {
    Value::Map(vec![
        (key(KEY_SECRET), Value::Bytes(record.secret.to_vec())),
        (
            key(KEY_COUNTER),
            Value::Bytes(record.counter.to_le_bytes().to_vec()),
        ),
        (
            key(KEY_ROOT_SECTOR),
            Value::Integer(Integer::from(record.tree_info.root.sector.get())),
        ),
        (
            key(KEY_ROOT_MAC),
            Value::Bytes(record.tree_info.root.mac.to_vec()),
        ),
        (
            key(KEY_MAX_EXTENT),
            Value::Integer(Integer::from(record.tree_info.maximum_extent)),
        ),
        (
            key(KEY_TREE_DEPTH),
            Value::Integer(Integer::from(record.tree_info.tree_depth as u64)),
        ),
    ])
}

fn master_file_from_value(value: &Value) -> Result<MasterFileRecord> {
    let entries = map_entries(value)?;
    let secret = as_bytes_exact::<32>(required(entries, KEY_SECRET)?)?;
    let counter = Counter::from_le_bytes(as_bytes_exact::<16>(required(
        entries,
        KEY_COUNTER,
    )?)?);
    let root_sector = as_u64(required(entries, KEY_ROOT_SECTOR)?)?;
    let root_mac = as_bytes_exact::<16>(required(entries, KEY_ROOT_MAC)?)?;
    let maximum_extent = as_u64(required(entries, KEY_MAX_EXTENT)?)?;
    let tree_depth = as_u64(required(entries, KEY_TREE_DEPTH)?)?;
    if tree_depth > crate::tree::lut::MAX_TREE_DEPTH as u64 {
        return Err(ErrorKind::IncompatibleProto.into());
    }

    Ok(MasterFileRecord {
        secret,
        counter,
        tree_info: RootSectorInfo {
            root: SectorReference {
                sector: SectorId::new(root_sector),
                mac: root_mac,
            },
            maximum_extent,
            tree_depth: tree_depth as usize,
        },
    })
}

pub(crate) fn encode_static_header(header: &StaticHeader) -> Result<Vec<u8>> {
    encode(&Value::Map(vec![
        (key(KEY_FORMAT_VERSION), Value::Integer(Integer::from(0u64))),
        (
            key(KEY_MASTER_SECRET),
            Value::Bytes(header.master_secret.to_vec()),
        ),
        (
            key(KEY_WRITE_COUNTER),
            Value::Bytes(header.write_counter.to_le_bytes().to_vec()),
        ),
    ]))
}

pub(crate) fn decode_static_header(raw: &[u8]) -> Result<StaticHeader> {
    let value = decode(raw)?;
    let entries = map_entries(&value)?;
    if as_u64(required(entries, KEY_FORMAT_VERSION)?)? != 0 {
        return Err(ErrorKind::UnknownFormatVersion.into());
    }
    let master_secret =
        as_bytes_exact::<64>(required(entries, KEY_MASTER_SECRET)?)?;
    let write_counter = Counter::from_le_bytes(as_bytes_exact::<16>(
        required(entries, KEY_WRITE_COUNTER)?,
    )?);
    Ok(StaticHeader {
        master_secret,
        write_counter,
    })
}

pub(crate) fn encode_archive_header(header: &ArchiveHeader) -> Result<Vec<u8>> {
    encode(&Value::Map(vec![
        (key(KEY_DIRECTORY), master_file_to_value(&header.directory)),
        (
            key(KEY_FREE_SECTOR_INDEX),
            master_file_to_value(&header.free_sector_index),
        ),
        (
            key(KEY_SECRET_COUNTER),
            Value::Bytes(header.secret_counter.to_le_bytes().to_vec()),
        ),
        (
            key(KEY_JOURNAL_COUNTER),
            Value::Bytes(header.journal_counter.to_le_bytes().to_vec()),
        ),
    ]))
}

pub(crate) fn decode_archive_header(raw: &[u8]) -> Result<ArchiveHeader> {
    let value = decode(raw)?;
    let entries = map_entries(&value)?;
    Ok(ArchiveHeader {
        directory: master_file_from_value(required(entries, KEY_DIRECTORY)?)?,
        free_sector_index: master_file_from_value(required(
            entries,
            KEY_FREE_SECTOR_INDEX,
        )?)?,
        secret_counter: Counter::from_le_bytes(as_bytes_exact::<16>(
            required(entries, KEY_SECRET_COUNTER)?,
        )?),
        journal_counter: Counter::from_le_bytes(as_bytes_exact::<16>(
            required(entries, KEY_JOURNAL_COUNTER)?,
        )?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_header_survives_the_codec() {
        let header = ArchiveHeader {
            directory: MasterFileRecord {
                secret: [1; 32],
                counter: Counter::from_le_bytes([2; 16]),
                tree_info: RootSectorInfo {
                    root: SectorReference {
                        sector: SectorId::new(42),
                        mac: [3; 16],
                    },
                    maximum_extent: 98304,
                    tree_depth: 1,
                },
            },
            free_sector_index: MasterFileRecord::default(),
            secret_counter: Counter::from_le_bytes([4; 16]),
            journal_counter: Counter::ZERO,
        };
        let raw = encode_archive_header(&header).unwrap();
        let decoded = decode_archive_header(&raw).unwrap();
        assert_eq!(decoded.directory.secret, [1; 32]);
        assert_eq!(decoded.directory.tree_info, header.directory.tree_info);
        assert_eq!(decoded.secret_counter, header.secret_counter);
    }

    #[test]
    fn missing_required_key_is_invalid_proto() {
        let raw = encode(&Value::Map(vec![(
            key(KEY_SECRET_COUNTER),
            Value::Bytes(vec![0; 16]),
        )]))
        .unwrap();
        let err = decode_archive_header(&raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidProto);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut entries = match decode(
            &encode_static_header(&StaticHeader {
                master_secret: [7; 64],
                write_counter: Counter::ZERO,
            })
            .unwrap(),
        )
        .unwrap()
        {
            Value::Map(entries) => entries,
            _ => unreachable!(),
        };
        entries.push((key(99), Value::Text("future field".into())));
        let raw = encode(&Value::Map(entries)).unwrap();
        let decoded = decode_static_header(&raw).unwrap();
        assert_eq!(decoded.master_secret, [7; 64]);
    }
}
