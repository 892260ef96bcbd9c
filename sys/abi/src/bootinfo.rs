// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Records the boot loader leaves in low memory for the kernel.
//!
//! Three things are handed over: the BIOS E820 map exactly as the firmware
//! reported it, the loader's own derived memory map (which already carves
//! out the kernel, the process-image blob, and the boot data), and the
//! process-image blob itself. All live at fixed physical addresses.

use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Physical address of the E820 entry count (u32), followed at
/// [`E820_ENTRIES`] by the packed entry array.
pub const E820_COUNT: u32 = 0x0000_0CD0;
pub const E820_ENTRIES: u32 = 0x0000_0CD4;

/// Physical address of the loader-derived map: count (u32) then entries.
pub const LOADER_MAP_COUNT: u32 = 0x0000_0E00;
pub const LOADER_MAP_ENTRIES: u32 = 0x0000_0E04;

/// Physical base of the process-image blob.
pub const PROC_IMAGE_BASE: u32 = 0x0100_0000;

/// One BIOS E820 record, as the firmware wrote it (ACPI 3.0 layout, with
/// the extended-attributes word).
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct E820Entry {
    pub base: u64,
    pub length: u64,
    pub kind: u32,
    pub attrs: u32,
}

/// E820 type of usable RAM.
pub const E820_AVAILABLE: u32 = 1;
/// E820 type of firmware-reserved memory.
pub const E820_RESERVED: u32 = 2;

/// Region kinds in the loader-derived map.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum RegionKind {
    Available = 0,
    Reserved = 1,
    Acpi = 2,
    AcpiNvs = 3,
    Kernel = 4,
    ProcImage = 5,
    BootData = 6,
}

impl core::convert::TryFrom<u32> for RegionKind {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, ()> {
        match x {
            0 => Ok(Self::Available),
            1 => Ok(Self::Reserved),
            2 => Ok(Self::Acpi),
            3 => Ok(Self::AcpiNvs),
            4 => Ok(Self::Kernel),
            5 => Ok(Self::ProcImage),
            6 => Ok(Self::BootData),
            _ => Err(()),
        }
    }
}

/// One record of the loader-derived memory map.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct LoaderMapEntry {
    pub base: u32,
    pub size: u32,
    pub kind: u32,
}

/// Process-image file types carried in blob headers.
pub const IMAGE_TYPE_DRIVER: u8 = 0;
pub const IMAGE_TYPE_SERVER: u8 = 1;
pub const IMAGE_TYPE_USER: u8 = 2;

/// Header preceding each image in the blob. Headers and images are both
/// padded out to [`IMAGE_ALIGN`]-byte boundaries; a zero-length name ends
/// the blob.
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ImageHeader {
    pub name: [u8; 256],
    pub size: u32,
    pub file_type: u8,
    pub padding: [u8; 251],
}

/// Blob alignment unit.
pub const IMAGE_ALIGN: usize = 512;

static_assertions::const_assert_eq!(
    core::mem::size_of::<ImageHeader>(),
    IMAGE_ALIGN
);

impl ImageHeader {
    /// Returns the file name as a byte slice, cut at the first NUL.
    pub fn name_bytes(&self) -> &[u8] {
        let n = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..n]
    }

    /// Number of bytes the image occupies in the blob, including padding.
    pub fn padded_size(&self) -> usize {
        (self.size as usize + IMAGE_ALIGN - 1) & !(IMAGE_ALIGN - 1)
    }
}
