//! The archive error type.
//!
//! Failures carry a closed [`ErrorKind`] plus whatever diagnostic details
//! were known at the failure site: the affected sector, the tree position,
//! the logical file and byte span, and an optional wrapped cause.

use std::error::Error as StdError;
use std::fmt;
use std::ops::Range;

use crate::id::{FileId, SectorId};
use crate::tree::TreePosition;

/// The closed set of archive failure conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    #[error("the file is not a vefs archive or its static header is damaged")]
    InvalidPrefix,
    #[error("the static header length field exceeds its container")]
    OversizedStaticHeader,
    #[error("neither archive header slot could be read")]
    NoArchiveHeader,
    #[error("the supplied user key does not unlock this archive")]
    WrongUserPrk,
    #[error("both archive header slots report the same version")]
    IdenticalHeaderVersion,
    #[error("unknown archive format version")]
    UnknownFormatVersion,
    #[error("an authentication tag mismatched during decryption")]
    TagMismatch,
    #[error("a stored structure failed to decode")]
    InvalidProto,
    #[error("a stored structure violates the format contract")]
    IncompatibleProto,
    #[error("a sector reference pointed outside the allocated tree")]
    SectorReferenceOutOfRange,
    #[error("a directory entry is inconsistent with its allocation bitmap")]
    CorruptIndexEntry,
    #[error("no free sectors or blocks are available")]
    ResourceExhausted,
    #[error("an internal allocation failed")]
    NotEnoughMemory,
    #[error("no file exists at the given path")]
    NoSuchVFile,
    #[error("the resource is locked or still referenced")]
    StillInUse,
    #[error("the directory size is not a whole number of sectors")]
    VFilesystemInvalidSize,
    #[error("a directory entry serialized to an unexpected size")]
    VFilesystemEntrySerializationFailed,
    #[error("the archive file does not exist")]
    ArchiveFileDidNotExist,
    #[error("the archive file already exists")]
    ArchiveFileAlreadyExisted,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no more data")]
    NoMoreData,
    #[error("host file i/o failed")]
    Io,
}

#[derive(Debug, Default)]
struct Details {
    sector: Option<SectorId>,
    position: Option<TreePosition>,
    file_id: Option<FileId>,
    file_path: Option<String>,
    span: Option<Range<u64>>,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

/// An archive failure: an [`ErrorKind`] with attached diagnostic details.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    details: Box<Details>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            details: Box::default(),
        }
    }

    /// Wraps `cause` while reporting `kind` to the caller, e.g. a tag
    /// mismatch on the static header surfacing as [`ErrorKind::WrongUserPrk`].
    pub fn wrapping(kind: ErrorKind, cause: impl Into<Error>) -> Self {
        Error::new(kind).with_source(cause.into())
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn sector(&self) -> Option<SectorId> {
        self.details.sector
    }

    pub fn position(&self) -> Option<TreePosition> {
        self.details.position
    }

    pub fn file_id(&self) -> Option<FileId> {
        self.details.file_id
    }

    pub fn file_path(&self) -> Option<&str> {
        self.details.file_path.as_deref()
    }

    pub fn span(&self) -> Option<Range<u64>> {
        self.details.span.clone()
    }

    pub fn with_sector(mut self, sector: SectorId) -> Self {
        self.details.sector.get_or_insert(sector);
        self
    }

    pub fn with_position(mut self, position: TreePosition) -> Self {
        self.details.position.get_or_insert(position);
        self
    }

    pub fn with_file_id(mut self, id: FileId) -> Self {
        self.details.file_id.get_or_insert(id);
        self
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.details.file_path.get_or_insert(path.into());
        self
    }

    pub fn with_span(mut self, span: Range<u64>) -> Self {
        self.details.span.get_or_insert(span);
        self
    }

    pub fn with_source(
        mut self,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        self.details.source.get_or_insert(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(path) = &self.details.file_path {
            write!(f, " [file {path:?}]")?;
        }
        if let Some(id) = self.details.file_id {
            write!(f, " [file-id {id}]")?;
        }
        if let Some(span) = &self.details.span {
            write!(f, " [bytes {}..{}]", span.start, span.end)?;
        }
        if let Some(position) = self.details.position {
            write!(f, " [{position:?}]")?;
        }
        if let Some(sector) = self.details.sector {
            write!(f, " [{sector}]")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.details
            .source
            .as_ref()
            .map(|err| err.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Io).with_source(err)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attaches diagnostic details to the error arm of a result.
pub trait ResultExt<T> {
    fn with_sector(self, sector: SectorId) -> Result<T>;
    fn with_position(self, position: TreePosition) -> Result<T>;
    fn with_file_id(self, id: FileId) -> Result<T>;
    fn with_file_path(self, path: &str) -> Result<T>;
    fn with_span(self, span: Range<u64>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    fn with_sector(self, sector: SectorId) -> Result<T> {
        self.map_err(|err| err.into().with_sector(sector))
    }

    fn with_position(self, position: TreePosition) -> Result<T> {
        self.map_err(|err| err.into().with_position(position))
    }

    fn with_file_id(self, id: FileId) -> Result<T> {
        self.map_err(|err| err.into().with_file_id(id))
    }

    fn with_file_path(self, path: &str) -> Result<T> {
        self.map_err(|err| err.into().with_file_path(path))
    }

    fn with_span(self, span: Range<u64>) -> Result<T> {
        self.map_err(|err| err.into().with_span(span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_accumulate_without_overwriting() {
        let err = Error::new(ErrorKind::TagMismatch)
            .with_sector(SectorId::new(7))
            .with_sector(SectorId::new(9));
        assert_eq!(err.kind(), ErrorKind::TagMismatch);
        assert_eq!(err.sector(), Some(SectorId::new(7)));
    }

    #[test]
    fn wrapped_cause_is_reachable_via_source() {
        let inner = Error::new(ErrorKind::TagMismatch);
        let outer = Error::wrapping(ErrorKind::WrongUserPrk, inner);
        assert_eq!(outer.kind(), ErrorKind::WrongUserPrk);
        let source = outer.source().expect("source");
        let inner = source.downcast_ref::<Error>().expect("inner error");
        assert_eq!(inner.kind(), ErrorKind::TagMismatch);
    }
}
