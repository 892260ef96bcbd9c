// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flat descriptor table.
//!
//! One code and one data segment per privilege ring {0, 3}, all covering the
//! full 4 GiB, plus a single TSS whose `esp0` the scheduler rewrites on every
//! context switch. `add` exists for the rare caller that needs an extra
//! descriptor; the fixed selectors below cover everything the kernel itself
//! does.

use abi::Error;

/// Fixed selectors, in table order.
pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const USER_CS: u16 = 0x18;
pub const USER_DS: u16 = 0x20;
pub const TSS_SEL: u16 = 0x28;

const GDT_NUM: usize = 16;

/// What a descriptor describes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SegKind {
    Code,
    Data,
    Tss,
}

pub struct Gdt {
    entries: [u64; GDT_NUM],
    next: usize,
}

impl Gdt {
    pub const fn new() -> Self {
        Self {
            entries: [0; GDT_NUM],
            next: 0,
        }
    }

    /// Builds the null descriptor, the four flat segments, and the TSS
    /// descriptor, in the order the fixed selectors assume.
    pub fn init(&mut self, tss_base: u32, tss_limit: u32) {
        self.entries = [0; GDT_NUM];
        self.next = 1; // null descriptor

        uassert!(self.push(0, u32::MAX, SegKind::Code, 0) == KERNEL_CS);
        uassert!(self.push(0, u32::MAX, SegKind::Data, 0) == KERNEL_DS);
        uassert!(self.push(0, u32::MAX, SegKind::Code, 3) == USER_CS);
        uassert!(self.push(0, u32::MAX, SegKind::Data, 3) == USER_DS);
        uassert!(
            self.push(tss_base, tss_limit, SegKind::Tss, 0) == TSS_SEL
        );
    }

    /// Encodes and installs a descriptor, returning its selector.
    pub fn add(
        &mut self,
        base: u32,
        limit: u32,
        kind: SegKind,
        dpl: u8,
    ) -> Result<u16, Error> {
        if self.next == GDT_NUM {
            return Err(Error::NoResource);
        }
        Ok(self.push(base, limit, kind, dpl))
    }

    /// Unchecked install; init fills the fixed slots through this.
    fn push(&mut self, base: u32, limit: u32, kind: SegKind, dpl: u8) -> u16 {
        uassert!(self.next < GDT_NUM);
        self.entries[self.next] = encode(base, limit, kind, dpl);
        let sel = (self.next * 8) as u16;
        self.next += 1;
        sel
    }

    /// The raw table, for `lgdt`.
    pub fn entries(&self) -> &[u64] {
        &self.entries[..self.next.max(1)]
    }
}

/// Encodes one descriptor. Limits above 2^20 bytes switch the descriptor to
/// page granularity; code and data segments get the 32-bit default-size
/// flag, the TSS stays byte-granular.
fn encode(base: u32, limit: u32, kind: SegKind, dpl: u8) -> u64 {
    let (limit, gran) = if limit > 0xF_FFFF {
        (limit >> 12, 1u64)
    } else {
        (limit, 0u64)
    };
    let access: u64 = match kind {
        SegKind::Code => 0x9A,
        SegKind::Data => 0x92,
        // Available 32-bit TSS, present.
        SegKind::Tss => 0x89,
    } | ((dpl as u64 & 3) << 5);
    let flags: u64 = match kind {
        SegKind::Tss => gran << 3,
        _ => 0x4 | (gran << 3), // 32-bit default operand size
    };

    (limit as u64 & 0xFFFF)
        | ((base as u64 & 0xFF_FFFF) << 16)
        | (access << 40)
        | ((limit as u64 >> 16 & 0xF) << 48)
        | (flags << 52)
        | ((base as u64 >> 24) << 56)
}
