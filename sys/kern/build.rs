// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generates the 256 per-vector interrupt entry stubs.
//!
//! Every IDT entry is routed through a near-identical naked function that
//! normalizes the stack (pushing a zero error code where the hardware does
//! not push one), pushes its vector number, and falls through to the common
//! save/restore trampoline. Rather than maintaining 256 copies by hand, or a
//! macro explosion, we write them out here and `include!` the result from
//! `arch::x86`.

use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

/// Vectors for which the processor pushes an error code of its own: #DF,
/// #TS, #NP, #SS, #GP, #PF, #AC.
const HAS_ERROR_CODE: [u8; 7] = [8, 10, 11, 12, 13, 14, 17];

fn main() {
    let mut out = String::new();

    out.push_str("// Generated by build.rs. Do not edit.\n\n");

    for vector in 0u16..=255 {
        let pushes_err = HAS_ERROR_CODE.contains(&(vector as u8));
        // Hardware-pushed error codes keep the frame layout uniform; fake one
        // for every other vector.
        let prologue = if pushes_err { "" } else { "push 0\n            " };
        writeln!(
            out,
            r#"#[unsafe(naked)]
unsafe extern "C" fn vector_stub_{vector}() {{
    core::arch::naked_asm!(
        "
            {prologue}push {vector}
            jmp {{common}}
        ",
        common = sym interrupt_entry_common,
    );
}}"#,
        )
        .unwrap();
    }

    out.push_str(
        "\npub(super) static VECTOR_STUBS: [unsafe extern \"C\" fn(); 256] = [\n",
    );
    for vector in 0u16..=255 {
        writeln!(out, "    vector_stub_{vector},").unwrap();
    }
    out.push_str("];\n");

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    fs::write(out_dir.join("vectors.rs"), out).unwrap();

    println!("cargo:rerun-if-changed=build.rs");
}
