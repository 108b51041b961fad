//! # WASI Preview1 Surface
//!
//! The subset of `wasi_snapshot_preview1` the bridge serves to the engine,
//! with the exact linear-memory layouts of the structures it exchanges.
//!
//! ## Layouts
//!
//! ```text
//! subscription (48 bytes)          event (32 bytes)
//!   0  userdata   u64                0  userdata   u64
//!   8  tag        u8                 8  error      u16
//!  16  fd         u32  (fd_read/     10  type       u8
//!                       fd_write)   16  nbytes     u64
//!  16  clock id   u32  (clock)      24  flags      u16
//!  24  timeout    u64
//!  32  precision  u64
//!  40  flags      u16
//! ```

// =============================================================================
// WASI Error Codes
// =============================================================================

/// WASI error codes (errno values) used by the bridge.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// No error.
    Success = 0,
    /// Resource unavailable, try again.
    Again = 6,
    /// Bad file descriptor.
    Badf = 8,
    /// Bad address.
    Fault = 21,
    /// Invalid argument.
    Inval = 28,
    /// Not supported.
    Notsup = 58,
}

impl Errno {
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

// =============================================================================
// WASI Types
// =============================================================================

/// Standard stream descriptors.
pub const STDIN_FD: u32 = 0;
pub const STDOUT_FD: u32 = 1;
pub const STDERR_FD: u32 = 2;

pub const SUBSCRIPTION_SIZE: usize = 48;
pub const EVENT_SIZE: usize = 32;
pub const IOVEC_SIZE: usize = 8;

/// Clock identifiers.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockId {
    /// Wall clock time.
    Realtime = 0,
    /// Monotonic clock (for measuring intervals).
    Monotonic = 1,
    /// Process CPU time.
    ProcessCputimeId = 2,
    /// Thread CPU time.
    ThreadCputimeId = 3,
}

impl ClockId {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Realtime),
            1 => Some(Self::Monotonic),
            2 => Some(Self::ProcessCputimeId),
            3 => Some(Self::ThreadCputimeId),
            _ => None,
        }
    }
}

/// Subscription / event type tag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Clock = 0,
    FdRead = 1,
    FdWrite = 2,
}

impl EventType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Clock),
            1 => Some(Self::FdRead),
            2 => Some(Self::FdWrite),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Clock subscription flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Subclockflags: u16 {
        /// Timeout is an absolute time rather than relative to now
        const ABSTIME = 1 << 0;
    }
}

/// What a subscription waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// A source becoming readable
    Read { fd: u32 },
    /// A sink becoming writable
    Write { fd: u32 },
    /// A clock reaching a deadline
    Clock {
        /// Raw clock id; validated when the deadline is computed
        id: u32,
        timeout: u64,
        precision: u64,
        flags: Subclockflags,
    },
}

/// One entry of the `poll_oneoff` input table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub userdata: u64,
    pub kind: SubscriptionKind,
}

impl Subscription {
    pub fn read(userdata: u64, fd: u32) -> Self {
        Self {
            userdata,
            kind: SubscriptionKind::Read { fd },
        }
    }

    pub fn write(userdata: u64, fd: u32) -> Self {
        Self {
            userdata,
            kind: SubscriptionKind::Write { fd },
        }
    }

    /// Relative timeout on `clock`.
    pub fn clock(userdata: u64, clock: ClockId, timeout: u64) -> Self {
        Self {
            userdata,
            kind: SubscriptionKind::Clock {
                id: clock as u32,
                timeout,
                precision: 0,
                flags: Subclockflags::empty(),
            },
        }
    }

    /// Absolute deadline on `clock`.
    pub fn clock_abs(userdata: u64, clock: ClockId, deadline: u64) -> Self {
        Self {
            userdata,
            kind: SubscriptionKind::Clock {
                id: clock as u32,
                timeout: deadline,
                precision: 0,
                flags: Subclockflags::ABSTIME,
            },
        }
    }

    pub fn event_type(&self) -> EventType {
        match self.kind {
            SubscriptionKind::Read { .. } => EventType::FdRead,
            SubscriptionKind::Write { .. } => EventType::FdWrite,
            SubscriptionKind::Clock { .. } => EventType::Clock,
        }
    }

    pub fn from_bytes(bytes: &[u8; SUBSCRIPTION_SIZE]) -> Result<Self, Errno> {
        let userdata = u64::from_le_bytes(field(bytes, 0));
        let u32_at = |off| u32::from_le_bytes(field(bytes, off));
        let u64_at = |off| u64::from_le_bytes(field(bytes, off));

        let kind = match EventType::from_u8(bytes[8]).ok_or(Errno::Notsup)? {
            EventType::FdRead => SubscriptionKind::Read { fd: u32_at(16) },
            EventType::FdWrite => SubscriptionKind::Write { fd: u32_at(16) },
            EventType::Clock => SubscriptionKind::Clock {
                id: u32_at(16),
                timeout: u64_at(24),
                precision: u64_at(32),
                flags: Subclockflags::from_bits_truncate(u16::from_le_bytes(field(bytes, 40))),
            },
        };
        Ok(Self { userdata, kind })
    }

    pub fn to_bytes(&self) -> [u8; SUBSCRIPTION_SIZE] {
        let mut bytes = [0u8; SUBSCRIPTION_SIZE];
        bytes[0..8].copy_from_slice(&self.userdata.to_le_bytes());
        bytes[8] = self.event_type() as u8;
        match self.kind {
            SubscriptionKind::Read { fd } | SubscriptionKind::Write { fd } => {
                bytes[16..20].copy_from_slice(&fd.to_le_bytes());
            }
            SubscriptionKind::Clock {
                id,
                timeout,
                precision,
                flags,
            } => {
                bytes[16..20].copy_from_slice(&id.to_le_bytes());
                bytes[24..32].copy_from_slice(&timeout.to_le_bytes());
                bytes[32..40].copy_from_slice(&precision.to_le_bytes());
                bytes[40..42].copy_from_slice(&flags.bits().to_le_bytes());
            }
        }
        bytes
    }
}

/// One entry of the `poll_oneoff` output table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub userdata: u64,
    pub error: Errno,
    pub event_type: EventType,
}

impl Event {
    pub fn to_bytes(&self) -> [u8; EVENT_SIZE] {
        let mut bytes = [0u8; EVENT_SIZE];
        bytes[0..8].copy_from_slice(&self.userdata.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.error.to_u16().to_le_bytes());
        bytes[10] = self.event_type as u8;
        bytes
    }

    /// Reads back the fields the bridge writes. Unknown errno values map
    /// to `Inval`.
    pub fn from_bytes(bytes: &[u8; EVENT_SIZE]) -> Option<Self> {
        let error = match u16::from_le_bytes(field(bytes, 8)) {
            0 => Errno::Success,
            6 => Errno::Again,
            8 => Errno::Badf,
            21 => Errno::Fault,
            58 => Errno::Notsup,
            _ => Errno::Inval,
        };
        Some(Self {
            userdata: u64::from_le_bytes(field(bytes, 0)),
            error,
            event_type: EventType::from_u8(bytes[10])?,
        })
    }
}

/// I/O vector for scatter/gather I/O.
#[derive(Debug, Clone, Copy)]
pub struct Iovec {
    pub buf: u32,
    pub buf_len: u32,
}

fn field<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

// =============================================================================
// Linear Memory Access
// =============================================================================

/// Bounds-checked view of `len` bytes at `ptr`.
pub fn slice(memory: &[u8], ptr: u32, len: usize) -> Result<&[u8], Errno> {
    let start = ptr as usize;
    let end = start.checked_add(len).ok_or(Errno::Fault)?;
    memory.get(start..end).ok_or(Errno::Fault)
}

pub fn slice_mut(memory: &mut [u8], ptr: u32, len: usize) -> Result<&mut [u8], Errno> {
    let start = ptr as usize;
    let end = start.checked_add(len).ok_or(Errno::Fault)?;
    memory.get_mut(start..end).ok_or(Errno::Fault)
}

pub fn read_array<const N: usize>(memory: &[u8], ptr: u32) -> Result<[u8; N], Errno> {
    Ok(field(slice(memory, ptr, N)?, 0))
}

pub fn write_u32(memory: &mut [u8], ptr: u32, value: u32) -> Result<(), Errno> {
    slice_mut(memory, ptr, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn write_u64(memory: &mut [u8], ptr: u32, value: u64) -> Result<(), Errno> {
    slice_mut(memory, ptr, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Reads `count` subscriptions starting at `ptr`.
pub fn read_subscriptions(
    memory: &[u8],
    ptr: u32,
    count: u32,
) -> Result<alloc::vec::Vec<Subscription>, Errno> {
    let total = (count as usize)
        .checked_mul(SUBSCRIPTION_SIZE)
        .ok_or(Errno::Fault)?;
    let table = slice(memory, ptr, total)?;
    table
        .chunks_exact(SUBSCRIPTION_SIZE)
        .map(|chunk| Subscription::from_bytes(&field(chunk, 0)))
        .collect()
}

/// Writes `events` as a contiguous table at `ptr`.
pub fn write_events(memory: &mut [u8], ptr: u32, events: &[Event]) -> Result<(), Errno> {
    let table = slice_mut(memory, ptr, events.len() * EVENT_SIZE)?;
    for (chunk, event) in table.chunks_exact_mut(EVENT_SIZE).zip(events) {
        chunk.copy_from_slice(&event.to_bytes());
    }
    Ok(())
}

/// Reads an iovec table.
pub fn read_iovecs(memory: &[u8], ptr: u32, count: u32) -> Result<alloc::vec::Vec<Iovec>, Errno> {
    let total = (count as usize).checked_mul(IOVEC_SIZE).ok_or(Errno::Fault)?;
    let table = slice(memory, ptr, total)?;
    Ok(table
        .chunks_exact(IOVEC_SIZE)
        .map(|iov| Iovec {
            buf: u32::from_le_bytes(field(iov, 0)),
            buf_len: u32::from_le_bytes(field(iov, 4)),
        })
        .collect())
}

/// Gathers the bytes an iovec table points at.
pub fn gather(memory: &[u8], iovs: u32, iovs_len: u32) -> Result<alloc::vec::Vec<u8>, Errno> {
    let mut data = alloc::vec::Vec::new();
    for iov in read_iovecs(memory, iovs, iovs_len)? {
        data.extend_from_slice(slice(memory, iov.buf, iov.buf_len as usize)?);
    }
    Ok(data)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_subscription_layout() {
        let sub = Subscription::clock_abs(0xdead_beef, ClockId::Monotonic, 5_000);
        let bytes = sub.to_bytes();

        assert_eq!(bytes[8], EventType::Clock as u8);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 1);
        assert_eq!(u64::from_le_bytes(bytes[24..32].try_into().unwrap()), 5_000);
        assert_eq!(u16::from_le_bytes(bytes[40..42].try_into().unwrap()), 1);
        assert_eq!(Subscription::from_bytes(&bytes), Ok(sub));
    }

    #[test]
    fn test_fd_subscription_layout() {
        let sub = Subscription::read(7, STDIN_FD);
        let bytes = sub.to_bytes();
        assert_eq!(bytes[8], 1);
        assert_eq!(Subscription::from_bytes(&bytes), Ok(sub));

        let mut bad = bytes;
        bad[8] = 9;
        assert_eq!(Subscription::from_bytes(&bad), Err(Errno::Notsup));
    }

    #[test]
    fn test_event_layout() {
        let ev = Event {
            userdata: 42,
            error: Errno::Success,
            event_type: EventType::FdWrite,
        };
        let bytes = ev.to_bytes();
        assert_eq!(u64::from_le_bytes(bytes[0..8].try_into().unwrap()), 42);
        assert_eq!(bytes[10], 2);
        assert_eq!(Event::from_bytes(&bytes), Some(ev));
    }

    #[test]
    fn test_memory_bounds() {
        let mut memory = [0u8; 64];
        assert_eq!(write_u32(&mut memory, 60, 1), Ok(()));
        assert_eq!(write_u32(&mut memory, 61, 1), Err(Errno::Fault));
        assert_eq!(write_u64(&mut memory, u32::MAX, 1), Err(Errno::Fault));
        assert_eq!(read_subscriptions(&memory, 0, 2), Err(Errno::Fault));
    }

    #[test]
    fn test_subscription_table() {
        let mut memory = [0u8; 256];
        let subs = [Subscription::write(1, STDOUT_FD), Subscription::clock(2, ClockId::Realtime, 9)];
        for (i, sub) in subs.iter().enumerate() {
            let at = 16 + i * SUBSCRIPTION_SIZE;
            memory[at..at + SUBSCRIPTION_SIZE].copy_from_slice(&sub.to_bytes());
        }
        assert_eq!(read_subscriptions(&memory, 16, 2).unwrap(), subs);
    }
}
