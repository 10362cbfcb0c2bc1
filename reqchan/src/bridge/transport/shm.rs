//! Shared-memory transport.
//!
//! Each direction is one mapped region holding a single message, guarded by
//! two named counting semaphores: `empty` (starts at 1) and `full` (starts
//! at 0). A sender waits on `empty`, writes, and posts `full`; a receiver
//! waits on `full`, copies, and posts `empty`.
//!
//! Region layout: `[u32 length (LE)][payload; max_message_size]`.
//! Object names: region `/{name}_c2s`, semaphores `/{name}_c2s_empty` and
//! `/{name}_c2s_full` (same for `s2c`).
//!
//! Regions go through `nix::sys::mman`; nix has no named-semaphore wrapper,
//! so the `sem_*` calls use libc directly.

use std::ffi::CString;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use bytes::Bytes;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use super::{DOWNSTREAM, Transport, TransportError, TransportKind, UPSTREAM, check_size};
use crate::bridge::protocol::Role;

const LEN_PREFIX: usize = 4;
const SEM_MODE: libc::mode_t = 0o600;

fn c_name(name: &str) -> Result<CString, TransportError> {
    CString::new(name).map_err(|_| TransportError::InvalidName(name.to_string()))
}

/// POSIX named semaphore handle. Closed on drop, never unlinked here.
struct NamedSemaphore {
    name: String,
    sem: NonNull<libc::sem_t>,
}

// SAFETY: sem_t handles from sem_open are process-wide and the sem_* calls
// are thread-safe.
unsafe impl Send for NamedSemaphore {}

impl NamedSemaphore {
    fn open(name: String, initial: u32) -> Result<Self, TransportError> {
        let c = c_name(&name)?;
        // SAFETY: valid NUL-terminated name; mode and value passed as the
        // variadic arguments O_CREAT requires.
        let sem = unsafe {
            libc::sem_open(
                c.as_ptr(),
                libc::O_CREAT,
                SEM_MODE as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(TransportError::create(name, io::Error::last_os_error()));
        }
        let sem = NonNull::new(sem)
            .ok_or_else(|| TransportError::create(name.clone(), io::Error::last_os_error()))?;
        Ok(Self { name, sem })
    }

    /// P(): block until the count is positive, then decrement it.
    fn wait(&self) -> io::Result<()> {
        loop {
            // SAFETY: sem is a live handle from sem_open.
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// V(): increment the count, waking one waiter.
    fn post(&self) -> io::Result<()> {
        // SAFETY: sem is a live handle from sem_open.
        if unsafe { libc::sem_post(self.sem.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn exists(name: &str) -> bool {
        let Ok(c) = CString::new(name) else {
            return false;
        };
        // SAFETY: valid name, no O_CREAT so no variadic arguments.
        let sem = unsafe { libc::sem_open(c.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return false;
        }
        // SAFETY: handle just returned by sem_open.
        unsafe { libc::sem_close(sem) };
        true
    }

    fn unlink(name: &str) {
        let Ok(c) = CString::new(name) else { return };
        // SAFETY: valid NUL-terminated name.
        if unsafe { libc::sem_unlink(c.as_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(semaphore = %name, error = %err, "Failed to unlink semaphore");
            }
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: handle from sem_open, closed exactly once.
        if unsafe { libc::sem_close(self.sem.as_ptr()) } != 0 {
            tracing::warn!(semaphore = %self.name, error = %io::Error::last_os_error(), "Failed to close semaphore");
        }
    }
}

/// One mapped shared-memory region. Unmapped on drop, never unlinked here.
struct SharedRegion {
    name: String,
    ptr: NonNull<u8>,
    len: NonZeroUsize,
}

// SAFETY: access to the mapping is serialized by the slot's semaphores.
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    fn open(name: String, len: usize) -> Result<Self, TransportError> {
        let Some(len) = NonZeroUsize::new(len) else {
            return Err(TransportError::create(name, io::Error::from(io::ErrorKind::InvalidInput)));
        };
        let flags = OFlag::O_RDWR | OFlag::O_CREAT;
        let fd = match shm_open(name.as_str(), flags, Mode::S_IRUSR | Mode::S_IWUSR) {
            Ok(fd) => fd,
            Err(e) => return Err(TransportError::create(name, e)),
        };
        if let Err(e) = ftruncate(&fd, len.get() as libc::off_t) {
            return Err(TransportError::create(name, e));
        }
        // SAFETY: a fresh shared mapping of a descriptor we own; nothing else
        // in this process aliases it.
        let addr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        };
        let ptr = match addr {
            Ok(addr) => addr.cast::<u8>(),
            Err(e) => return Err(TransportError::create(name, e)),
        };
        Ok(Self { name, ptr, len })
    }

    fn exists(name: &str) -> bool {
        shm_open(name, OFlag::O_RDONLY, Mode::empty()).is_ok()
    }

    fn unlink(name: &str) {
        match shm_unlink(name) {
            Ok(()) | Err(Errno::ENOENT) => {}
            Err(e) => tracing::warn!(region = %name, error = %e, "Failed to unlink shared memory"),
        }
    }

    /// Store `payload` with its length prefix. Caller holds the slot.
    fn write(&mut self, payload: &[u8]) {
        debug_assert!(LEN_PREFIX + payload.len() <= self.len.get());
        let len = (payload.len() as u32).to_le_bytes();
        // SAFETY: both copies stay inside the `len`-byte mapping; the
        // semaphore protocol gives this side exclusive access.
        unsafe {
            std::ptr::copy_nonoverlapping(len.as_ptr(), self.ptr.as_ptr(), LEN_PREFIX);
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.ptr.as_ptr().add(LEN_PREFIX),
                payload.len(),
            );
        }
    }

    /// Copy out the stored message. Caller holds the slot.
    fn read(&self) -> Bytes {
        let mut len = [0u8; LEN_PREFIX];
        // SAFETY: the prefix lies inside the mapping.
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), len.as_mut_ptr(), LEN_PREFIX) };
        let len = (u32::from_le_bytes(len) as usize).min(self.len.get() - LEN_PREFIX);

        let mut out = vec![0u8; len];
        // SAFETY: `len` is clamped to the payload area of the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(LEN_PREFIX), out.as_mut_ptr(), len)
        };
        Bytes::from(out)
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the mapping created in `open`.
        if let Err(e) = unsafe { munmap(self.ptr.cast(), self.len.get()) } {
            tracing::warn!(region = %self.name, error = %e, "Failed to unmap shared memory");
        }
    }
}

/// One direction of the channel: a region plus its two semaphores.
struct Slot {
    region: SharedRegion,
    empty: NamedSemaphore,
    full: NamedSemaphore,
}

impl Slot {
    fn names(base: &str) -> [String; 3] {
        [
            base.to_string(),
            format!("{base}_empty"),
            format!("{base}_full"),
        ]
    }

    fn open(base: &str, max_message_size: usize) -> Result<Self, TransportError> {
        let [region, empty, full] = Self::names(base);
        Ok(Self {
            region: SharedRegion::open(region, LEN_PREFIX + max_message_size)?,
            empty: NamedSemaphore::open(empty, 1)?,
            full: NamedSemaphore::open(full, 0)?,
        })
    }

    fn push(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.empty
            .wait()
            .map_err(|e| TransportError::send(self.empty.name.as_str(), e))?;
        self.region.write(payload);
        self.full
            .post()
            .map_err(|e| TransportError::send(self.full.name.as_str(), e))
    }

    fn pop(&mut self) -> Result<Bytes, TransportError> {
        self.full
            .wait()
            .map_err(|e| TransportError::receive(self.full.name.as_str(), e))?;
        let msg = self.region.read();
        self.empty
            .post()
            .map_err(|e| TransportError::receive(self.empty.name.as_str(), e))?;
        Ok(msg)
    }

    fn exists(base: &str) -> bool {
        let [region, empty, full] = Self::names(base);
        SharedRegion::exists(&region) || NamedSemaphore::exists(&empty) || NamedSemaphore::exists(&full)
    }

    fn unlink(base: &str) {
        let [region, empty, full] = Self::names(base);
        SharedRegion::unlink(&region);
        NamedSemaphore::unlink(&empty);
        NamedSemaphore::unlink(&full);
    }
}

pub struct SharedMemoryTransport {
    name: String,
    inbound: Slot,
    outbound: Slot,
    max_message_size: usize,
    role: Role,
}

impl SharedMemoryTransport {
    pub fn open(name: &str, role: Role, max_message_size: usize) -> Result<Self, TransportError> {
        let upstream = format!("/{name}_{UPSTREAM}");
        let downstream = format!("/{name}_{DOWNSTREAM}");

        let slots = Slot::open(&upstream, max_message_size)
            .and_then(|up| Ok((up, Slot::open(&downstream, max_message_size)?)));
        let (up, down) = match slots {
            Ok(pair) => pair,
            Err(e) => {
                if role.owns_resources() {
                    Slot::unlink(&upstream);
                    Slot::unlink(&downstream);
                }
                return Err(e);
            }
        };

        let (inbound, outbound) = match role {
            Role::Responder => (up, down),
            Role::Initiator => (down, up),
        };

        tracing::trace!(name, %role, "Shared memory slots mapped");

        Ok(Self {
            name: name.to_string(),
            inbound,
            outbound,
            max_message_size,
            role,
        })
    }

    pub fn exists(name: &str) -> bool {
        Slot::exists(&format!("/{name}_{UPSTREAM}")) || Slot::exists(&format!("/{name}_{DOWNSTREAM}"))
    }

    /// Unlink both slots without opening them.
    pub fn unlink(name: &str) {
        Slot::unlink(&format!("/{name}_{UPSTREAM}"));
        Slot::unlink(&format!("/{name}_{DOWNSTREAM}"));
    }
}

impl Transport for SharedMemoryTransport {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        check_size(payload, self.max_message_size)?;
        self.outbound.push(payload)
    }

    fn receive(&mut self) -> Result<Bytes, TransportError> {
        self.inbound.pop()
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn kind(&self) -> TransportKind {
        TransportKind::SharedMemory
    }
}

impl Drop for SharedMemoryTransport {
    fn drop(&mut self) {
        if self.role.owns_resources() {
            Self::unlink(&self.name);
            tracing::trace!(name = %self.name, "Unlinked shared memory slots");
        }
    }
}
