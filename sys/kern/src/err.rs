// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Service code spends a lot of effort classifying misbehavior; this module
//! keeps that concern in one place. Every service returns `Result<_,
//! UserError>`, and a single wrapper in the dispatcher turns the result into
//! either a filled-in parameter block or a halted task.

use abi::Error;

/// An error committed by user code when invoking a service.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// A recoverable error. The service leaves all kernel state unchanged
    /// and the number is reported through the `err` field of the caller's
    /// parameter block.
    Recoverable(Error),
    /// An unrecoverable error. The offending task is halted: logged, placed
    /// permanently in the waiting state, and never scheduled again.
    Unrecoverable(FaultInfo),
}

impl From<Error> for UserError {
    fn from(e: Error) -> Self {
        Self::Recoverable(e)
    }
}

impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        Self::Unrecoverable(f)
    }
}

/// A record describing a fault taken by a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultInfo {
    /// The task handed the kernel an address it may not use, or touched
    /// memory it has no mapping for. The address is `None` when the
    /// processor could not report one.
    MemoryAccess { address: Option<u32> },
    /// Divide error with no handler installed by the task.
    DivideByZero,
    /// The processor rejected an instruction.
    IllegalInstruction,
    /// A trap fired on a vector nothing claims.
    UnknownVector(u8),
    /// The task passed a structurally invalid parameter block.
    BadParamBlock,
}
