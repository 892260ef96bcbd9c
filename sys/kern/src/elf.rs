// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loader for 32-bit ELF process images.
//!
//! The kernel accepts little-endian `EXEC` or `DYN` images for the i386
//! with their entry point in the user half. Each `PT_LOAD` segment gets
//! fresh frames, zeroed, filled from the file, and mapped at `p_vaddr`
//! with write access only where `p_flags` grants it.

use abi::memmap::{page_round_down, page_round_up, PAGE_SIZE};
use abi::Error;
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, KnownLayout};

use crate::mm::page::{DirId, PageFlags, PageMgr};
use crate::mm::phys::PhysAllocator;

const EI_NIDENT: usize = 16;

const ELFMAG: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_386: u16 = 3;

const PT_LOAD: u32 = 1;

const PF_W: u32 = 2;

#[derive(Copy, Clone, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct Ehdr {
    e_ident: [u8; EI_NIDENT],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[derive(Copy, Clone, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

/// What `load` built: the entry point, the highest mapped user address
/// (the break starts past it), and the segment frames for teardown.
#[derive(Debug, PartialEq)]
pub struct LoadInfo {
    pub entry: u32,
    pub image_end: u32,
    segs: [(u32, u32, u32); MAX_SEGS], // (vaddr, frame, size)
    seg_count: usize,
}

const MAX_SEGS: usize = 8;

/// Parses and materializes `image` into `dir`.
pub fn load(
    phys: &mut PhysAllocator,
    pages: &mut PageMgr,
    dir: DirId,
    image: &[u8],
) -> Result<LoadInfo, Error> {
    let (ehdr, _) = Ehdr::read_from_prefix(image).map_err(|_| Error::Param)?;

    if ehdr.e_ident[..4] != ELFMAG
        || ehdr.e_ident[4] != ELFCLASS32
        || ehdr.e_ident[5] != ELFDATA2LSB
    {
        return Err(Error::Param);
    }
    if ehdr.e_type != ET_EXEC && ehdr.e_type != ET_DYN {
        return Err(Error::Param);
    }
    if ehdr.e_machine != EM_386 {
        return Err(Error::Param);
    }
    if !crate::task::user_addr_ok(ehdr.e_entry, 1) {
        return Err(Error::Param);
    }
    if ehdr.e_phentsize as usize != core::mem::size_of::<Phdr>() {
        return Err(Error::Param);
    }

    let mut info = LoadInfo {
        entry: ehdr.e_entry,
        image_end: 0,
        segs: [(0, 0, 0); MAX_SEGS],
        seg_count: 0,
    };

    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff as usize + i * core::mem::size_of::<Phdr>();
        let parsed = image.get(off..).and_then(|rest| {
            Phdr::read_from_prefix(rest).ok()
        });
        let (ph, _) = match parsed {
            Some(p) => p,
            None => {
                unload(phys, pages, dir, &info);
                return Err(Error::Param);
            }
        };
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }
        if let Err(e) = load_segment(phys, pages, dir, image, &ph, &mut info)
        {
            unload(phys, pages, dir, &info);
            return Err(e);
        }
    }
    if info.seg_count == 0 {
        return Err(Error::Param);
    }
    Ok(info)
}

fn load_segment(
    phys: &mut PhysAllocator,
    pages: &mut PageMgr,
    dir: DirId,
    image: &[u8],
    ph: &Phdr,
    info: &mut LoadInfo,
) -> Result<(), Error> {
    let seg_base = page_round_down(ph.p_vaddr);
    let seg_end = page_round_up(
        ph.p_vaddr.checked_add(ph.p_memsz).ok_or(Error::Param)?,
    );
    let seg_size = seg_end - seg_base;
    if !crate::task::user_addr_ok(seg_base, seg_size) {
        return Err(Error::Param);
    }
    if info.seg_count == MAX_SEGS {
        return Err(Error::NoResource);
    }
    let file_end = (ph.p_offset as usize)
        .checked_add(ph.p_filesz as usize)
        .ok_or(Error::Param)?;
    if ph.p_filesz > ph.p_memsz || file_end > image.len() {
        return Err(Error::Param);
    }

    let frames = phys.alloc(seg_size).ok_or(Error::NoMemory)?;
    pages.set_phys(frames, 0, seg_size as usize);
    pages.fill_phys(
        frames + (ph.p_vaddr - seg_base),
        &image[ph.p_offset as usize..file_end],
    );

    let mut flags = PageFlags::USER;
    if ph.p_flags & PF_W != 0 {
        flags |= PageFlags::RW;
    }
    if let Err(e) = pages.map(phys, dir, seg_base, frames, seg_size, flags) {
        phys.free(frames);
        return Err(e);
    }

    info.segs[info.seg_count] = (seg_base, frames, seg_size);
    info.seg_count += 1;
    info.image_end = info.image_end.max(seg_end);
    Ok(())
}

/// Tears down everything a failed or abandoned `load` built.
pub fn unload(
    phys: &mut PhysAllocator,
    pages: &mut PageMgr,
    dir: DirId,
    info: &LoadInfo,
) {
    for &(vaddr, frame, size) in &info.segs[..info.seg_count] {
        pages.unmap(phys, dir, vaddr, size);
        phys.free(frame);
    }
}

#[cfg(test)]
pub(crate) mod testimg {
    //! Tiny ELF images assembled by hand for loader tests.

    use super::*;
    use zerocopy::IntoBytes;
    use zerocopy_derive::{Immutable, IntoBytes};

    #[derive(IntoBytes, Immutable)]
    #[repr(C)]
    struct RawEhdr {
        ident: [u8; 16],
        t: u16,
        machine: u16,
        version: u32,
        entry: u32,
        phoff: u32,
        shoff: u32,
        flags: u32,
        ehsize: u16,
        phentsize: u16,
        phnum: u16,
        shentsize: u16,
        shnum: u16,
        shstrndx: u16,
    }

    #[derive(IntoBytes, Immutable)]
    #[repr(C)]
    struct RawPhdr {
        t: u32,
        offset: u32,
        vaddr: u32,
        paddr: u32,
        filesz: u32,
        memsz: u32,
        flags: u32,
        align: u32,
    }

    /// Builds a one-segment image: `payload` mapped at `vaddr`, entry at
    /// `vaddr`.
    pub fn one_segment(
        vaddr: u32,
        payload: &[u8],
        memsz: u32,
        writable: bool,
    ) -> Vec<u8> {
        let mut ident = [0u8; 16];
        ident[..4].copy_from_slice(&ELFMAG);
        ident[4] = ELFCLASS32;
        ident[5] = ELFDATA2LSB;
        ident[6] = 1;
        let ehdr = RawEhdr {
            ident,
            t: ET_EXEC,
            machine: EM_386,
            version: 1,
            entry: vaddr,
            phoff: 52,
            shoff: 0,
            flags: 0,
            ehsize: 52,
            phentsize: 32,
            phnum: 1,
            shentsize: 0,
            shnum: 0,
            shstrndx: 0,
        };
        let phdr = RawPhdr {
            t: PT_LOAD,
            offset: 84,
            vaddr,
            paddr: vaddr,
            filesz: payload.len() as u32,
            memsz,
            flags: if writable { 5 | PF_W } else { 5 },
            align: PAGE_SIZE as u32,
        };
        let mut out = Vec::new();
        out.extend_from_slice(ehdr.as_bytes());
        out.extend_from_slice(phdr.as_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Corrupts the machine field of a well-formed image.
    pub fn wrong_machine(vaddr: u32) -> Vec<u8> {
        let mut img = one_segment(vaddr, b"\x90", 1, false);
        img[18] = 40; // EM_ARM
        img
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use abi::memmap::USER_BASE;

    #[test]
    fn well_formed_image_loads_and_maps() {
        let (mut phys, mut pages) = testutil::seeded_mm();
        let dir = pages.alloc_dir(&mut phys, 1).unwrap();
        let img =
            testimg::one_segment(USER_BASE, b"\xB8\x2A\x00\x00\x00", 0x2000, true);
        let info = load(&mut phys, &mut pages, dir, &img).unwrap();
        assert_eq!(info.entry, USER_BASE);
        assert_eq!(info.image_end, USER_BASE + 0x2000);

        let (frame, flags) = pages.walk(dir, USER_BASE).unwrap();
        assert!(flags.contains(PageFlags::USER | PageFlags::RW));
        let mut head = [0u8; 5];
        pages.read_phys(frame, &mut head);
        assert_eq!(&head, b"\xB8\x2A\x00\x00\x00");
        // The zero-fill beyond filesz.
        let mut tail = [0u8; 4];
        pages.read_phys(frame + 0x1000, &mut tail);
        assert_eq!(tail, [0; 4]);
    }

    #[test]
    fn read_only_segments_map_without_write() {
        let (mut phys, mut pages) = testutil::seeded_mm();
        let dir = pages.alloc_dir(&mut phys, 1).unwrap();
        let img = testimg::one_segment(USER_BASE, b"\x90", 0x1000, false);
        load(&mut phys, &mut pages, dir, &img).unwrap();
        let (_, flags) = pages.walk(dir, USER_BASE).unwrap();
        assert!(!flags.contains(PageFlags::RW));
    }

    #[test]
    fn foreign_and_malformed_images_are_rejected() {
        let (mut phys, mut pages) = testutil::seeded_mm();
        let dir = pages.alloc_dir(&mut phys, 1).unwrap();
        let free_before = phys.free_pages();

        assert_eq!(
            load(&mut phys, &mut pages, dir, &testimg::wrong_machine(USER_BASE)),
            Err(Error::Param)
        );
        assert_eq!(
            load(&mut phys, &mut pages, dir, b"not an elf"),
            Err(Error::Param)
        );
        // Entry outside the user half.
        let img = testimg::one_segment(0x0010_0000, b"\x90", 0x1000, false);
        assert_eq!(load(&mut phys, &mut pages, dir, &img), Err(Error::Param));

        // Nothing leaked along any rejection path.
        assert_eq!(phys.free_pages(), free_before);
    }

    #[test]
    fn unload_returns_every_frame() {
        let (mut phys, mut pages) = testutil::seeded_mm();
        let dir = pages.alloc_dir(&mut phys, 1).unwrap();
        let free_before = phys.free_pages();
        let img = testimg::one_segment(USER_BASE, b"\x90", 0x3000, true);
        let info = load(&mut phys, &mut pages, dir, &img).unwrap();
        unload(&mut phys, &mut pages, dir, &info);
        assert_eq!(phys.free_pages(), free_before);
    }
}
