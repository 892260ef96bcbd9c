// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading what the boot loader left behind.
//!
//! The loader parks three things at fixed physical addresses before it
//! jumps to the kernel: the raw BIOS E820 map, its own derived memory map,
//! and the process-image blob. The parsers here work over byte slices so
//! the same code reads simulated boot data in tests.

use abi::bootinfo::{
    E820Entry, ImageHeader, LoaderMapEntry, IMAGE_ALIGN,
};
use zerocopy::FromBytes;

/// Parses `count` packed E820 records out of `bytes`. Truncated input
/// ends the iteration early rather than faulting.
pub fn parse_e820(
    bytes: &[u8],
    count: usize,
) -> impl Iterator<Item = E820Entry> + '_ {
    let stride = core::mem::size_of::<E820Entry>();
    (0..count).map_while(move |i| {
        E820Entry::read_from_prefix(bytes.get(i * stride..)?)
            .ok()
            .map(|(e, _)| e)
    })
}

/// Parses `count` loader-map records out of `bytes`.
pub fn parse_loader_map(
    bytes: &[u8],
    count: usize,
) -> impl Iterator<Item = LoaderMapEntry> + '_ {
    let stride = core::mem::size_of::<LoaderMapEntry>();
    (0..count).map_while(move |i| {
        LoaderMapEntry::read_from_prefix(bytes.get(i * stride..)?)
            .ok()
            .map(|(e, _)| e)
    })
}

/// Walks the process-image blob: a sequence of 512-byte headers, each
/// followed by its image padded to 512 bytes. A header with an empty name
/// terminates the blob.
pub struct ImageIter<'a> {
    blob: &'a [u8],
}

impl<'a> ImageIter<'a> {
    pub fn new(blob: &'a [u8]) -> Self {
        Self { blob }
    }
}

impl<'a> Iterator for ImageIter<'a> {
    type Item = (ImageHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let (header, _) = ImageHeader::read_from_prefix(self.blob).ok()?;
        if header.name_bytes().is_empty() {
            return None;
        }
        let image = self
            .blob
            .get(IMAGE_ALIGN..IMAGE_ALIGN + header.size as usize)?;
        let advance = IMAGE_ALIGN + header.padded_size();
        self.blob = self.blob.get(advance..).unwrap_or(&[]);
        Some((header, image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::bootinfo::{E820_AVAILABLE, IMAGE_TYPE_DRIVER, IMAGE_TYPE_SERVER};
    use zerocopy::IntoBytes;

    fn header(name: &str, size: u32, file_type: u8) -> ImageHeader {
        let mut h = ImageHeader {
            name: [0; 256],
            size,
            file_type,
            padding: [0; 251],
        };
        h.name[..name.len()].copy_from_slice(name.as_bytes());
        h
    }

    #[test]
    fn e820_entries_parse_packed() {
        let entries = [
            E820Entry {
                base: 0,
                length: 0x9FC00,
                kind: E820_AVAILABLE,
                attrs: 0,
            },
            E820Entry {
                base: 0x10_0000,
                length: 0x1F00_0000,
                kind: E820_AVAILABLE,
                attrs: 0,
            },
        ];
        let mut bytes = Vec::new();
        for e in &entries {
            bytes.extend_from_slice(e.as_bytes());
        }
        let parsed: Vec<_> = parse_e820(&bytes, 2).collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].base, 0x10_0000);
        assert_eq!(parsed[1].length, 0x1F00_0000);
        // Truncated input stops early.
        assert_eq!(parse_e820(&bytes[..30], 2).count(), 1);
    }

    #[test]
    fn image_blob_walk_yields_each_image() {
        let mut blob = Vec::new();
        blob.extend_from_slice(header("ata.drv", 600, IMAGE_TYPE_DRIVER).as_bytes());
        blob.extend_from_slice(&[0xAA; 600]);
        blob.extend_from_slice(&[0; 1024 - 600]); // pad to 512 multiple
        blob.extend_from_slice(header("fs.srv", 512, IMAGE_TYPE_SERVER).as_bytes());
        blob.extend_from_slice(&[0xBB; 512]);
        blob.extend_from_slice(header("", 0, 0).as_bytes()); // terminator

        let imgs: Vec<_> = ImageIter::new(&blob).collect();
        assert_eq!(imgs.len(), 2);
        assert_eq!(imgs[0].0.name_bytes(), b"ata.drv");
        assert_eq!(imgs[0].1.len(), 600);
        assert!(imgs[0].1.iter().all(|&b| b == 0xAA));
        assert_eq!(imgs[1].0.name_bytes(), b"fs.srv");
        assert_eq!(imgs[1].1[0], 0xBB);
    }

    #[test]
    fn blob_without_terminator_ends_at_truncation() {
        let mut blob = Vec::new();
        blob.extend_from_slice(header("a", 600, IMAGE_TYPE_DRIVER).as_bytes());
        blob.extend_from_slice(&[0; 100]); // truncated image
        assert_eq!(ImageIter::new(&blob).count(), 0);
    }
}
