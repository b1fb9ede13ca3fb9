// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.
//
// The execution buffer the rest of the workspace talks about in the
// abstract (spec §5's "must be allocated with execute-plus-read (plus
// write during emission) permissions") is a raw `mmap`/`mprotect` region
// here. Grounded in the two-phase allocate-RW/finalize-RX pattern the
// pack's `cranelift-jit`/`cranelift-simplejit` crates use for exactly the
// same purpose — this replaces the teacher's delegation to `JITModule` for
// that half of its job, since the rest of `JITModule` (Cranelift's own
// code generation) has no role here at all.

use anna_types::ResourceError;

/// A single anonymous, page-aligned mapping that starts read-write and is
/// flipped to read-execute exactly once, by [`ExecutableMemory::make_executable`].
/// Never resizes — callers size it up front via [`ExecutableMemory::new`].
pub struct ExecutableMemory {
    base: *mut u8,
    capacity: usize,
    len: usize,
    executable: bool,
}

// The mapping is privately owned by this struct and never shared; moving
// an `ExecutableMemory` between threads is sound as long as the caller
// doesn't write into it concurrently with another writer, which `Assembler`
// never does (single-threaded per spec §5).
unsafe impl Send for ExecutableMemory {}

impl ExecutableMemory {
    pub fn new(capacity: usize) -> Result<Self, ResourceError> {
        let page_size = page_size();
        let rounded = align_up(capacity.max(1), page_size);

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                rounded,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ResourceError::Exhausted { resource: "executable memory arena", capacity: rounded });
        }

        Ok(ExecutableMemory { base: base as *mut u8, capacity: rounded, len: 0, executable: false })
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.len
    }

    /// Copies `bytes` to the end of the region and returns the absolute
    /// address they now live at. The region must still be writable (see
    /// [`Self::make_executable`]).
    pub fn push(&mut self, bytes: &[u8]) -> Result<usize, ResourceError> {
        if self.executable {
            return Err(ResourceError::Exhausted { resource: "executable memory arena (already finalized)", capacity: self.capacity });
        }
        if bytes.len() > self.remaining() {
            return Err(ResourceError::Exhausted { resource: "executable memory arena", capacity: self.capacity });
        }
        let address = self.base as usize + self.len;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(self.len), bytes.len());
        }
        self.len += bytes.len();
        Ok(address)
    }

    /// Overwrites already-placed bytes in place (used to resolve a
    /// [`anna_encoder_x86_64::GlobalPatch`] once the function holding it has
    /// a known load address). `offset` is relative to the region's base, not
    /// to any one function's placement within it.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) {
        debug_assert!(!self.executable, "patching after make_executable would require a RW/RX toggle");
        debug_assert!(offset + bytes.len() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(offset), bytes.len());
        }
    }

    /// Flips the region from read-write to read-execute. No further
    /// [`Self::push`] is possible afterward — this mirrors the write-once
    /// execution buffer spec §5 describes ("once a function is frozen, its
    /// byte range is immutable").
    pub fn make_executable(&mut self) -> Result<(), ResourceError> {
        if self.executable {
            return Ok(());
        }
        let result = unsafe { libc::mprotect(self.base as *mut libc::c_void, self.capacity, libc::PROT_READ | libc::PROT_EXEC) };
        if result != 0 {
            return Err(ResourceError::Exhausted { resource: "mprotect(PROT_READ|PROT_EXEC)", capacity: self.capacity });
        }
        self.executable = true;
        Ok(())
    }

    pub fn base_address(&self) -> usize {
        self.base as usize
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.capacity);
        }
    }
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshly_allocated_region_has_the_requested_capacity_rounded_to_a_page() {
        let region = ExecutableMemory::new(16).unwrap();
        assert!(region.capacity >= 16);
        assert_eq!(region.remaining(), region.capacity);
    }

    #[test]
    fn push_past_capacity_is_an_error() {
        let mut region = ExecutableMemory::new(4).unwrap();
        let tiny = vec![0u8; region.capacity];
        region.push(&tiny).unwrap();
        assert!(region.push(&[0u8]).is_err());
    }

    #[test]
    fn pushed_bytes_are_readable_back_through_the_returned_address() {
        let mut region = ExecutableMemory::new(64).unwrap();
        let address = region.push(&[0xC3]).unwrap();
        let byte = unsafe { *(address as *const u8) };
        assert_eq!(byte, 0xC3);
    }
}
