//! The sector device: exclusive owner of the host file.

mod header;
mod sector_device;

pub use sector_device::{
    read_archive_personalization_area, ArchiveOpening, MasterFileInfo,
    SectorDevice,
};
