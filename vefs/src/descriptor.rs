//! Directory entry serialization.
//!
//! Each entry is a CBOR map with small integer keys, wrapped in a CBOR
//! byte-string whose header carries the encoded size. Unknown keys are
//! ignored on decode so newer writers stay readable.

use ciborium::value::{Integer, Value};

use vefs_storage::crypto::Counter;
use vefs_storage::error::{ErrorKind, Result};
use vefs_storage::id::{FileId, SectorId};
use vefs_storage::tree::{RootSectorInfo, SectorReference};

const KEY_FILE_ID: u64 = 1;
const KEY_FILE_PATH: u64 = 2;
const KEY_SECRET: u64 = 3;
const KEY_SECRET_COUNTER: u64 = 4;
const KEY_ROOT_SECTOR: u64 = 5;
const KEY_ROOT_MAC: u64 = 6;
const KEY_MAX_EXTENT: u64 = 7;
const KEY_TREE_DEPTH: u64 = 8;
const KEY_MODIFICATION_TIME: u64 = 9;

/// In-memory form of one directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileDescriptor {
    pub file_id: FileId,
    pub file_path: String,
    pub secret: [u8; 32],
    pub secret_counter: Counter,
    pub tree_info: RootSectorInfo,
    pub modification_time: Option<String>,
}

fn key(raw: u64) -> Value {
    Value::Integer(Integer::from(raw))
}

fn lookup<'v>(entries: &'v [(Value, Value)], wanted: u64) -> Option<&'v Value> {
    entries.iter().find_map(|(k, v)| match k {
        Value::Integer(i) if *i == Integer::from(wanted) => Some(v),
        _ => None,
    })
}

fn required<'v>(entries: &'v [(Value, Value)], wanted: u64) -> Result<&'v Value> {
    lookup(entries, wanted).ok_or_else(|| ErrorKind::InvalidProto.into())
}

fn as_bytes_exact<const N: usize>(value: &Value) -> Result<[u8; N]> {
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

fn as_u64(value: &Value) -> Result<u64> {
    match value {
        Value::Integer(i) => {
            u64::try_from(*i).map_err(|_| ErrorKind::IncompatibleProto.into())
        }
        _ => Err(ErrorKind::InvalidProto.into()),
    }
}

impl FileDescriptor {
    /// Encodes the bare CBOR map (without the byte-string frame).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut entries = vec![
            (key(KEY_FILE_ID), Value::Bytes(self.file_id.as_bytes().to_vec())),
            (key(KEY_FILE_PATH), Value::Text(self.file_path.clone())),
            (key(KEY_SECRET), Value::Bytes(self.secret.to_vec())),
            (
                key(KEY_SECRET_COUNTER),
                Value::Bytes(self.secret_counter.to_le_bytes().to_vec()),
            ),
            (
                key(KEY_ROOT_SECTOR),
                Value::Integer(Integer::from(self.tree_info.root.sector.get())),
            ),
            (
                key(KEY_ROOT_MAC),
                Value::Bytes(self.tree_info.root.mac.to_vec()),
            ),
            (
                key(KEY_MAX_EXTENT),
                Value::Integer(Integer::from(self.tree_info.maximum_extent)),
            ),
            (
                key(KEY_TREE_DEPTH),
                Value::Integer(Integer::from(self.tree_info.tree_depth as u64)),
            ),
        ];
        if let Some(time) = &self.modification_time {
            entries.push((key(KEY_MODIFICATION_TIME), Value::Text(time.clone())));
        }

        let mut buffer = Vec::new();
        ciborium::ser::into_writer(&Value::Map(entries), &mut buffer)
            .map_err(|_| ErrorKind::VFilesystemEntrySerializationFailed)?;
        Ok(buffer)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let value: Value = ciborium::de::from_reader(raw)
            .map_err(|_| ErrorKind::InvalidProto)?;
        let Value::Map(entries) = value else {
            return Err(ErrorKind::InvalidProto.into());
        };

        let file_id =
            FileId::from_bytes(as_bytes_exact::<16>(required(&entries, KEY_FILE_ID)?)?);
        let file_path = match required(&entries, KEY_FILE_PATH)? {
            Value::Text(text) => text.clone(),
            _ => return Err(ErrorKind::InvalidProto.into()),
        };
        let secret = as_bytes_exact::<32>(required(&entries, KEY_SECRET)?)?;
        let secret_counter = Counter::from_le_bytes(as_bytes_exact::<16>(
            required(&entries, KEY_SECRET_COUNTER)?,
        )?);
        let root_sector = as_u64(required(&entries, KEY_ROOT_SECTOR)?)?;
        let root_mac = as_bytes_exact::<16>(required(&entries, KEY_ROOT_MAC)?)?;
        let maximum_extent = as_u64(required(&entries, KEY_MAX_EXTENT)?)?;
        let tree_depth = as_u64(required(&entries, KEY_TREE_DEPTH)?)? as usize;
        let modification_time = match lookup(&entries, KEY_MODIFICATION_TIME) {
            Some(Value::Text(text)) if !text.is_empty() => Some(text.clone()),
            Some(Value::Text(_)) | None => None,
            Some(_) => return Err(ErrorKind::InvalidProto.into()),
        };

        Ok(FileDescriptor {
            file_id,
            file_path,
            secret,
            secret_counter,
            tree_info: RootSectorInfo {
                root: SectorReference {
                    sector: SectorId::new(root_sector),
                    mac: root_mac,
                },
                maximum_extent,
                tree_depth,
            },
            modification_time,
        })
    }
}

/// Emits a CBOR byte-string header announcing `len` payload bytes.
pub(crate) fn bstr_head(len: usize) -> Vec<u8> {
    const MAJOR_BSTR: u8 = 2 << 5;
    if len < 24 {
        vec![MAJOR_BSTR | len as u8]
    } else if len <= u8::MAX as usize {
        vec![MAJOR_BSTR | 24, len as u8]
    } else if len <= u16::MAX as usize {
        let raw = (len as u16).to_be_bytes();
        vec![MAJOR_BSTR | 25, raw[0], raw[1]]
    } else {
        let raw = (len as u32).to_be_bytes();
        vec![MAJOR_BSTR | 26, raw[0], raw[1], raw[2], raw[3]]
    }
}

/// Parses a CBOR byte-string header; returns `(header_len, payload_len)`.
pub(crate) fn parse_bstr_head(raw: &[u8]) -> Result<(usize, usize)> {
    let first = *raw.first().ok_or(ErrorKind::InvalidProto)?;
    if first >> 5 != 2 {
        return Err(ErrorKind::InvalidProto.into());
    }
    let info = first & 0x1f;
    match info {
        0..=23 => Ok((1, info as usize)),
        24 => {
            let len = *raw.get(1).ok_or(ErrorKind::InvalidProto)?;
            Ok((2, len as usize))
        }
        25 => {
            let bytes: [u8; 2] = raw
                .get(1..3)
                .ok_or(ErrorKind::InvalidProto)?
                .try_into()
                .expect("slice has length two");
            Ok((3, u16::from_be_bytes(bytes) as usize))
        }
        26 => {
            let bytes: [u8; 4] = raw
                .get(1..5)
                .ok_or(ErrorKind::InvalidProto)?
                .try_into()
                .expect("slice has length four");
            Ok((5, u32::from_be_bytes(bytes) as usize))
        }
        _ => Err(ErrorKind::InvalidProto.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileDescriptor {
        FileDescriptor {
            file_id: FileId::from_bytes([9u8; 16]),
            file_path: "docs/notes.txt".into(),
            secret: [3u8; 32],
            secret_counter: Counter::from_le_bytes([1u8; 16]),
            tree_info: RootSectorInfo {
                root: SectorReference {
                    sector: SectorId::new(17),
                    mac: [6u8; 16],
                },
                maximum_extent: 4711,
                tree_depth: 1,
            },
            modification_time: None,
        }
    }

    #[test]
    fn descriptors_survive_the_codec() {
        let descriptor = sample();
        let raw = descriptor.encode().unwrap();
        assert_eq!(FileDescriptor::decode(&raw).unwrap(), descriptor);
    }

    #[test]
    fn missing_required_keys_fail_decoding() {
        let raw = {
            let mut buffer = Vec::new();
            let map = Value::Map(vec![(
                key(KEY_FILE_PATH),
                Value::Text("only a path".into()),
            )]);
            ciborium::ser::into_writer(&map, &mut buffer).unwrap();
            buffer
        };
        let err = FileDescriptor::decode(&raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidProto);
    }

    #[test]
    fn bstr_head_widths_match_their_payload_sizes() {
        assert_eq!(bstr_head(5), vec![0x45]);
        assert_eq!(bstr_head(200), vec![0x58, 200]);
        assert_eq!(bstr_head(1000), vec![0x59, 0x03, 0xe8]);

        for len in [0usize, 23, 24, 255, 256, 65535, 65536] {
            let head = bstr_head(len);
            let (head_len, payload_len) = parse_bstr_head(&head).unwrap();
            assert_eq!(head_len, head.len());
            assert_eq!(payload_len, len);
        }
    }
}
