//! Scripted engine for exercising the bridge without a real module.
//!
//! `MockCore` stands in for linear memory and the asyncify exports.
//! `MockEngine` runs a list of ops; when it is re-entered in the rewinding
//! state it jumps back to the op that unwound, as an instrumented module
//! replays its call stack down to the import that suspended it.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::bridge::Bridge;
use crate::engine::{Engine, EngineControl, SuspendState, Trap, PAGE_SIZE};
use crate::scheduler::CheckpointRegion;
use crate::wasi::{self, Errno, Event, Subscription, EVENT_SIZE, SUBSCRIPTION_SIZE};

pub const IN_PTR: u32 = 1024;
pub const OUT_PTR: u32 = 4096;
pub const NEVENTS_PTR: u32 = 8192;
pub const NBYTES_PTR: u32 = 8200;
pub const IOVEC_PTR: u32 = 16384;
pub const DATA_PTR: u32 = 16448;
pub const DATA_MAX: usize = 16320;

pub const RESERVED_REGION: CheckpointRegion = CheckpointRegion {
    data_ptr: 32768,
    stack_start: 32776,
    stack_end: 65536,
};

/// Memory plus asyncify state.
pub struct MockCore {
    pub memory: Vec<u8>,
    pub state: SuspendState,
    /// Bounds the header must hold whenever an unwind starts
    pub expected: Option<CheckpointRegion>,
    /// One entry per unwind: whether the header was freshly reset
    pub unwind_headers: Vec<bool>,
}

impl MockCore {
    pub fn new() -> Self {
        Self {
            memory: vec![0u8; PAGE_SIZE],
            state: SuspendState::Normal,
            expected: Some(RESERVED_REGION),
            unwind_headers: Vec::new(),
        }
    }

    pub fn headers_ok(&self) -> bool {
        !self.unwind_headers.is_empty() && self.unwind_headers.iter().all(|ok| *ok)
    }

    pub fn header(&self, data_ptr: u32) -> (u32, u32) {
        let at = data_ptr as usize;
        let word = |off: usize| {
            u32::from_le_bytes(self.memory[at + off..at + off + 4].try_into().unwrap())
        };
        (word(0), word(4))
    }
}

impl EngineControl for MockCore {
    fn memory(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    fn grow_memory(&mut self, pages: u32) -> Option<u32> {
        let old = (self.memory.len() / PAGE_SIZE) as u32;
        self.memory.resize(self.memory.len() + pages as usize * PAGE_SIZE, 0);
        Some(old)
    }

    fn suspend_state(&mut self) -> u32 {
        self.state as u32
    }

    fn start_unwind(&mut self, data_ptr: u32) {
        let ok = match self.expected {
            Some(region) => {
                region.data_ptr == data_ptr && self.header(data_ptr) == (region.stack_start, region.stack_end)
            }
            None => {
                let (start, end) = self.header(data_ptr);
                start == data_ptr + 8 && end as usize == self.memory.len()
            }
        };
        self.unwind_headers.push(ok);
        // Saving the stack moves the header's current pointer.
        let (start, _) = self.header(data_ptr);
        let at = data_ptr as usize;
        self.memory[at..at + 4].copy_from_slice(&(start + 256).to_le_bytes());
        self.state = SuspendState::Unwinding;
    }

    fn stop_unwind(&mut self) {
        self.state = SuspendState::Normal;
    }

    fn start_rewind(&mut self, _data_ptr: u32) {
        self.state = SuspendState::Rewinding;
    }

    fn stop_rewind(&mut self) {
        self.state = SuspendState::Normal;
    }
}

pub fn write_subscriptions(core: &mut MockCore, subs: &[Subscription]) {
    for (i, sub) in subs.iter().enumerate() {
        let at = IN_PTR as usize + i * SUBSCRIPTION_SIZE;
        core.memory[at..at + SUBSCRIPTION_SIZE].copy_from_slice(&sub.to_bytes());
    }
}

pub fn read_events(core: &mut MockCore) -> Vec<Event> {
    let count = u32::from_le_bytes(wasi::read_array(&core.memory, NEVENTS_PTR).unwrap());
    (0..count as usize)
        .map(|i| {
            let at = OUT_PTR as usize + i * EVENT_SIZE;
            Event::from_bytes(&core.memory[at..at + EVENT_SIZE].try_into().unwrap()).unwrap()
        })
        .collect()
}

/// One step of a scripted engine.
#[derive(Debug, Clone)]
pub enum Op {
    /// Call `poll_oneoff`
    Poll(Vec<Subscription>),
    /// Call `poll_oneoff` twice without honouring the first unwind
    PollTwice(Vec<Subscription>),
    /// Call `fd_write` with these bytes
    Write(u32, Vec<u8>),
    /// Call `fd_read` on stdin with a buffer of this size
    Read(usize),
    /// Call `proc_exit`
    Exit(u32),
    /// Trap
    Abort(&'static str),
}

pub struct MockEngine {
    pub core: MockCore,
    script: Vec<Op>,
    checkpoint: Option<usize>,
    reserved: bool,
    pub entry_calls: u32,
    pub polls: Vec<(Errno, Vec<Event>)>,
    pub reads: Vec<(Errno, Vec<u8>)>,
}

impl MockEngine {
    pub fn new(script: Vec<Op>) -> Self {
        Self {
            core: MockCore::new(),
            script,
            checkpoint: None,
            reserved: true,
            entry_calls: 0,
            polls: Vec::new(),
            reads: Vec::new(),
        }
    }

    /// An image without a reserved checkpoint region.
    pub fn without_reserved_region(script: Vec<Op>) -> Self {
        let mut engine = Self::new(script);
        engine.reserved = false;
        engine.core.expected = None;
        engine
    }

    fn poll(&mut self, host: &mut Bridge, subs: &[Subscription]) -> Result<Errno, Trap> {
        write_subscriptions(&mut self.core, subs);
        host.poll_oneoff(&mut self.core, IN_PTR, OUT_PTR, subs.len() as u32, NEVENTS_PTR)
    }

    fn run_op(&mut self, host: &mut Bridge, op: &Op) -> Result<(), Trap> {
        match op {
            Op::Poll(subs) => {
                let errno = self.poll(host, subs)?;
                match self.core.state {
                    SuspendState::Unwinding => return Ok(()),
                    SuspendState::Rewinding => {
                        return Err(Trap::Abort(String::from("rewind not stopped by import")))
                    }
                    SuspendState::Normal => {}
                }
                let events = if errno == Errno::Success {
                    read_events(&mut self.core)
                } else {
                    Vec::new()
                };
                self.polls.push((errno, events));
            }
            Op::PollTwice(subs) => {
                self.poll(host, subs)?;
                self.poll(host, subs)?;
            }
            Op::Write(fd, bytes) => {
                let len = bytes.len().min(DATA_MAX);
                let at = DATA_PTR as usize;
                self.core.memory[at..at + len].copy_from_slice(&bytes[..len]);
                self.set_iovec(len);
                host.fd_write(&mut self.core, *fd, IOVEC_PTR, 1, NBYTES_PTR);
            }
            Op::Read(max) => {
                let len = (*max).min(DATA_MAX);
                self.set_iovec(len);
                let errno = host.fd_read(&mut self.core, wasi::STDIN_FD, IOVEC_PTR, 1, NBYTES_PTR);
                let n = u32::from_le_bytes(wasi::read_array(&self.core.memory, NBYTES_PTR).unwrap());
                let at = DATA_PTR as usize;
                let data = if errno == Errno::Success {
                    self.core.memory[at..at + n as usize].to_vec()
                } else {
                    Vec::new()
                };
                self.reads.push((errno, data));
            }
            Op::Exit(code) => return Err(host.proc_exit(*code)),
            Op::Abort(msg) => return Err(Trap::Abort(String::from(*msg))),
        }
        Ok(())
    }

    fn set_iovec(&mut self, len: usize) {
        wasi::write_u32(&mut self.core.memory, IOVEC_PTR, DATA_PTR).unwrap();
        wasi::write_u32(&mut self.core.memory, IOVEC_PTR + 4, len as u32).unwrap();
        wasi::write_u32(&mut self.core.memory, NBYTES_PTR, 0).unwrap();
    }
}

impl EngineControl for MockEngine {
    fn memory(&mut self) -> &mut [u8] {
        self.core.memory()
    }

    fn grow_memory(&mut self, pages: u32) -> Option<u32> {
        self.core.grow_memory(pages)
    }

    fn suspend_state(&mut self) -> u32 {
        self.core.suspend_state()
    }

    fn start_unwind(&mut self, data_ptr: u32) {
        self.core.start_unwind(data_ptr)
    }

    fn stop_unwind(&mut self) {
        self.core.stop_unwind()
    }

    fn start_rewind(&mut self, data_ptr: u32) {
        self.core.start_rewind(data_ptr)
    }

    fn stop_rewind(&mut self) {
        self.core.stop_rewind()
    }
}

impl Engine for MockEngine {
    fn call_entry(&mut self, host: &mut Bridge) -> Result<(), Trap> {
        self.entry_calls += 1;
        let mut pc = match self.core.state {
            SuspendState::Rewinding => self
                .checkpoint
                .take()
                .ok_or_else(|| Trap::Abort(String::from("rewind without checkpoint")))?,
            _ => 0,
        };

        while pc < self.script.len() {
            let op = self.script[pc].clone();
            self.run_op(host, &op)?;
            if self.core.state == SuspendState::Unwinding {
                self.checkpoint = Some(pc);
                return Ok(());
            }
            pc += 1;
        }
        Ok(())
    }

    fn reserved_checkpoint(&mut self) -> Option<CheckpointRegion> {
        self.reserved.then_some(RESERVED_REGION)
    }
}
