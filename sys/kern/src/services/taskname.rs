// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `task-name` family: a fixed registry mapping bounded strings to
//! live task ids. Registration is reserved to non-user tasks; lookup is
//! open to everyone.

use abi::{
    taskname, Error, TaskId, TaskNameParam, ProcType, TASKNAME_LEN_MAX,
    TASKNAME_NUM,
};

use crate::arch::InterruptFrame;
use crate::err::UserError;
use crate::kernel::Kernel;
use crate::umem;

#[derive(Copy, Clone)]
struct Entry {
    used: bool,
    task: TaskId,
    len: u16,
    name: [u8; TASKNAME_LEN_MAX + 1],
}

const ENTRY_EMPTY: Entry = Entry {
    used: false,
    task: TaskId::NONE,
    len: 0,
    name: [0; TASKNAME_LEN_MAX + 1],
};

pub struct Registry {
    entries: [Entry; TASKNAME_NUM],
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            entries: [ENTRY_EMPTY; TASKNAME_NUM],
        }
    }

    fn find(&self, name: &[u8]) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.used && &e.name[..e.len as usize] == name)
    }

    /// Binds `name` to `task`. One name per task, one task per name.
    pub fn register(
        &mut self,
        task: TaskId,
        name: &[u8],
    ) -> Result<(), Error> {
        if name.is_empty() || name.len() > TASKNAME_LEN_MAX {
            return Err(Error::Param);
        }
        if self.find(name).is_some()
            || self.entries.iter().any(|e| e.used && e.task == task)
        {
            return Err(Error::Registered);
        }
        let slot = self
            .entries
            .iter_mut()
            .find(|e| !e.used)
            .ok_or(Error::NoResource)?;
        *slot = ENTRY_EMPTY;
        slot.used = true;
        slot.task = task;
        slot.len = name.len() as u16;
        slot.name[..name.len()].copy_from_slice(name);
        Ok(())
    }

    /// Drops `task`'s own registration.
    pub fn unregister(&mut self, task: TaskId) -> Result<(), Error> {
        match self
            .entries
            .iter_mut()
            .find(|e| e.used && e.task == task)
        {
            Some(e) => {
                *e = ENTRY_EMPTY;
                Ok(())
            }
            None => Err(Error::NoRegistered),
        }
    }

    pub fn lookup(&self, name: &[u8]) -> Result<TaskId, Error> {
        self.find(name)
            .map(|e| e.task)
            .ok_or(Error::NoRegistered)
    }
}

pub fn handler(k: &mut Kernel, _vec: u8, frame: &mut InterruptFrame) {
    super::dispatch::<TaskNameParam>(k, frame, |k, caller, p| {
        match p.header.func_id {
            taskname::FUNC_REGISTER => {
                require_non_user(k, caller)?;
                let name = read_name(k, caller, p.name)?;
                k.names
                    .register(caller, &name.0[..name.1])
                    .map_err(UserError::Recoverable)
            }
            taskname::FUNC_UNREGISTER => {
                require_non_user(k, caller)?;
                k.names
                    .unregister(caller)
                    .map_err(UserError::Recoverable)
            }
            taskname::FUNC_GET => {
                let name = read_name(k, caller, p.name)?;
                p.task_id = k
                    .names
                    .lookup(&name.0[..name.1])
                    .map_err(UserError::Recoverable)?;
                Ok(())
            }
            _ => Err(Error::Param.into()),
        }
    });
}

fn require_non_user(k: &Kernel, caller: TaskId) -> Result<(), UserError> {
    if k.tasks.ptype_of(caller) == ProcType::User {
        return Err(Error::Unauthorized.into());
    }
    Ok(())
}

fn read_name(
    k: &Kernel,
    caller: TaskId,
    va: u32,
) -> Result<([u8; TASKNAME_LEN_MAX + 1], usize), UserError> {
    let mut buf = [0u8; TASKNAME_LEN_MAX + 1];
    let len = umem::read_cstr(k, caller, va, &mut buf)?;
    if len == 0 || len > TASKNAME_LEN_MAX {
        return Err(Error::Param.into());
    }
    Ok((buf, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_unregister_round_trip() {
        let mut r = Registry::new();
        let t = TaskId::from_parts(3, 0);
        r.register(t, b"ata-driver").unwrap();
        assert_eq!(r.lookup(b"ata-driver"), Ok(t));
        r.unregister(t).unwrap();
        assert_eq!(r.lookup(b"ata-driver"), Err(Error::NoRegistered));
        assert_eq!(r.unregister(t), Err(Error::NoRegistered));
    }

    #[test]
    fn duplicate_names_and_tasks_are_rejected() {
        let mut r = Registry::new();
        let a = TaskId::from_parts(3, 0);
        let b = TaskId::from_parts(4, 0);
        r.register(a, b"console").unwrap();
        assert_eq!(r.register(b, b"console"), Err(Error::Registered));
        assert_eq!(r.register(a, b"other"), Err(Error::Registered));
        // Freed names are reusable.
        r.unregister(a).unwrap();
        r.register(b, b"console").unwrap();
    }

    #[test]
    fn name_length_is_bounded() {
        let mut r = Registry::new();
        let t = TaskId::from_parts(3, 0);
        assert_eq!(r.register(t, b""), Err(Error::Param));
        let long = [b'x'; TASKNAME_LEN_MAX + 1];
        assert_eq!(r.register(t, &long), Err(Error::Param));
        let exact = [b'x'; TASKNAME_LEN_MAX];
        r.register(t, &exact).unwrap();
    }

    #[test]
    fn table_exhaustion_reports_no_resource() {
        let mut r = Registry::new();
        for i in 0..TASKNAME_NUM as u32 {
            let mut name = *b"task-000";
            name[5] = b'0' + ((i / 100) % 10) as u8;
            name[6] = b'0' + ((i / 10) % 10) as u8;
            name[7] = b'0' + (i % 10) as u8;
            r.register(TaskId::from_parts(i % 60, i / 60), &name)
                .unwrap();
        }
        assert_eq!(
            r.register(TaskId::from_parts(63, 31), b"straw"),
            Err(Error::NoResource)
        );
    }
}
