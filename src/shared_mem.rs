//! Anonymous shared memory the parent and its forked children/soakers use to
//! talk to each other without a socket: one flat mmap'd array, one slot per
//! child, each slot aligned to its own cache line so children updating their
//! own counters don't bounce a line the parent is reading from a neighbor.
//!
//! Mirrors `struct child_control`/`struct soak_control` and `start_children`/
//! `start_soakers` in `rds-stress.c`.

use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::os::fd::BorrowedFd;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytemuck::{Pod, Zeroable};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::Pid;

use crate::counters::CounterSet;

/// Epoch offset in whole seconds plus a microsecond remainder, laid out so
/// the all-zero value (no mmap zero-init ever produces a valid timestamp
/// otherwise) means "not set yet" — matching the original's `tv_sec == 0`
/// sentinel for "the run hasn't started".
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WireTime {
    pub secs: u64,
    pub micros: u32,
    _pad: u32,
}

impl WireTime {
    pub fn now() -> WireTime {
        WireTime::from(SystemTime::now())
    }

    pub fn is_set(&self) -> bool {
        self.secs != 0
    }

    pub fn to_system_time(self) -> Option<SystemTime> {
        self.is_set().then(|| UNIX_EPOCH + Duration::new(self.secs, self.micros * 1_000))
    }
}

impl From<SystemTime> for WireTime {
    fn from(t: SystemTime) -> WireTime {
        let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        WireTime { secs: since.as_secs(), micros: since.subsec_micros(), _pad: 0 }
    }
}

/// Cache-line padding so adjacent slots in the mmap'd array never share a
/// line. 256 bytes, matching the original's `__attribute__((aligned(256)))`.
const SLOT_ALIGN: usize = 256;

/// One child's state, as seen by both the child (writer of `cur`) and the
/// parent (reader of everything, writer of `start`).
#[repr(C, align(256))]
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildControl {
    pub pid: i32,
    ready: u32,
    pub start: WireTime,
    pub cur: CounterSet,
    pub last: CounterSet,
}

static_assertions::const_assert!(std::mem::size_of::<ChildControl>() % SLOT_ALIGN == 0);

impl ChildControl {
    pub fn is_ready(&self) -> bool {
        self.ready != 0
    }

    pub fn set_ready(&mut self) {
        self.ready = 1;
    }
}

/// One CPU soaker's state: how many `getpid()` calls per second it's
/// currently managing, used to gauge spare CPU capacity.
#[repr(C, align(256))]
#[derive(Debug, Clone, Copy, Default)]
pub struct SoakControl {
    pub pid: i32,
    _pad: u32,
    pub per_sec: u64,
    pub counter: u64,
    pub last: u64,
    pub start: WireTime,
}

static_assertions::const_assert!(std::mem::size_of::<SoakControl>() % SLOT_ALIGN == 0);

impl SoakControl {
    pub fn with(pid: i32, per_sec: u64, counter: u64, last: u64) -> SoakControl {
        SoakControl { pid, per_sec, counter, last, ..Default::default() }
    }
}

/// An anonymous `MAP_SHARED` mapping of `len` `T`s, visible to this process
/// and every descendant forked after the mapping was made. Unmapped on drop.
pub struct SharedArray<T> {
    ptr: *mut T,
    len: usize,
}

// Safety: the mapping is MAP_SHARED and every access goes through the slice
// accessors below; T is Pod so there's no uninitialized-read hazard.
unsafe impl<T: Send> Send for SharedArray<T> {}
unsafe impl<T: Sync> Sync for SharedArray<T> {}

impl<T: Copy> SharedArray<T> {
    /// Maps `len` zero-initialized `T`s. Safe only when an all-zero bit
    /// pattern is a valid `T` — true for [`ChildControl`] and
    /// [`SoakControl`], the only types this is used with.
    pub fn new(len: usize) -> nix::Result<SharedArray<T>> {
        let byte_len = len * std::mem::size_of::<T>();
        let length = NonZeroUsize::new(byte_len).expect("shared array length must be nonzero");
        // Safety: anonymous, fd-less mapping; no prior mapping at this
        // address to race with since we pass `addr = None`.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_ANONYMOUS | MapFlags::MAP_SHARED,
                None::<BorrowedFd>,
                0,
            )?
        } as *mut T;

        // Safety: freshly mapped PROT_READ|PROT_WRITE memory, all-zero is a
        // valid bit pattern for both control structs this is used with.
        // `write_bytes`'s count is in units of `T`, not bytes — `len`, not
        // `byte_len`.
        unsafe { std::ptr::write_bytes(ptr, 0, len) };

        Ok(SharedArray { ptr, len })
    }
}

impl<T> Deref for SharedArray<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        // Safety: ptr/len came from a single successful mmap of len*size_of::<T>() bytes.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<T> DerefMut for SharedArray<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // Safety: see Deref; &mut self guarantees exclusive Rust-side access
        // (the mapping itself is shared with other processes by design).
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl<T> Drop for SharedArray<T> {
    fn drop(&mut self) {
        let byte_len = self.len * std::mem::size_of::<T>();
        if !self.ptr.is_null() {
            // Safety: unmapping exactly the region `new` mapped.
            unsafe {
                let _ = munmap(self.ptr as *mut std::ffi::c_void, byte_len);
            }
        }
    }
}

/// `true` once `pid`'s process has exited (reaped or not).
pub fn process_is_alive(pid: i32) -> bool {
    nix::sys::signal::kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_array_round_trips_and_zero_inits() {
        let mut arr: SharedArray<ChildControl> = SharedArray::new(4).unwrap();
        for slot in arr.iter() {
            assert!(!slot.is_ready());
            assert_eq!(slot.pid, 0);
        }
        arr[2].set_ready();
        arr[2].pid = 42;
        assert!(arr[2].is_ready());
        assert!(!arr[0].is_ready());
        assert_eq!(arr[2].pid, 42);
    }

    #[test]
    fn wire_time_sentinel_and_round_trip() {
        assert!(!WireTime::default().is_set());
        let now = WireTime::now();
        assert!(now.is_set());
        assert!(now.to_system_time().is_some());
    }

    #[test]
    fn control_structs_are_cache_line_sized() {
        assert_eq!(std::mem::size_of::<ChildControl>() % 256, 0);
        assert_eq!(std::mem::size_of::<SoakControl>() % 256, 0);
    }
}
