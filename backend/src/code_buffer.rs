use std::io;
use std::ptr;

/// Default arena size: 16 MiB of host code.
const DEFAULT_CODE_BUF_SIZE: usize = 16 * 1024 * 1024;

/// Executable arena for generated host code.
///
/// One anonymous mapping holds the dispatch thunks followed by every
/// translated block. The mapping stays readable, writable and
/// executable for its whole lifetime: linkage slots are rewritten from
/// upcalls while the executor is resident in the same region, so
/// permissions cannot be toggled around individual writes.
///
/// Code is only ever appended at the cursor. There is no per-block
/// reclamation; a failed translation rewinds the cursor over its
/// partial output, and a full flush rewinds it to just past the
/// thunks. Everything already emitted keeps its address until then,
/// which is what lets thunks and patched jumps embed absolute
/// positions.
pub struct CodeBuffer {
    base: *mut u8,
    len: usize,
    cursor: usize,
}

impl CodeBuffer {
    /// Map an arena of at least `size` bytes (rounded up to whole
    /// pages). Failure to map is fatal to JIT construction; there is
    /// no fallback arena.
    pub fn new(size: usize) -> io::Result<Self> {
        let len = round_to_page(size);

        // SAFETY: anonymous private mapping; no file, no fixed address.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            base: base.cast(),
            len,
            cursor: 0,
        })
    }

    /// Map with the default size (16 MiB).
    pub fn with_default_size() -> io::Result<Self> {
        Self::new(DEFAULT_CODE_BUF_SIZE)
    }

    // -- Cursor --

    /// Append cursor, as an offset from the buffer base. Captured
    /// before emitting a block to name its entry, and again afterwards
    /// to bound the emitted region.
    #[inline]
    pub fn offset(&self) -> usize {
        self.cursor
    }

    /// Total mapped bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Bytes still available for new code. The controller checks this
    /// against a worst-case block bound before translating, so the
    /// emit primitives below only ever trip their own checks on a
    /// broken translator.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.len - self.cursor
    }

    /// Move the cursor back to an earlier position: dropping the
    /// partial output of a failed translation, or every block at once
    /// during a flush. Code past the cursor is dead and will be
    /// overwritten by later appends.
    #[inline]
    pub fn set_offset(&mut self, offset: usize) {
        assert!(offset <= self.len);
        self.cursor = offset;
    }

    /// Pad with NOPs until the cursor is `n`-aligned. Thunk entry
    /// points are aligned this way.
    pub fn align(&mut self, n: usize) {
        assert!(n.is_power_of_two());
        while self.cursor & (n - 1) != 0 {
            self.emit_u8(0x90);
        }
    }

    // -- Address queries --

    /// Start of the mapping; also the address of offset 0.
    #[inline]
    pub fn base_ptr(&self) -> *const u8 {
        self.base.cast_const()
    }

    /// Address the next emitted byte will land at.
    #[inline]
    pub fn current_ptr(&self) -> *const u8 {
        self.ptr_at(self.cursor)
    }

    /// Address of a buffer offset (a thunk, a block entry, a linkage
    /// slot).
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *const u8 {
        assert!(offset <= self.len);
        // SAFETY: offset is within the mapping.
        unsafe { self.base.add(offset).cast_const() }
    }

    /// Offset of a host address inside the mapping, if it is inside.
    pub fn offset_of(&self, addr: *const u8) -> Option<usize> {
        let start = self.base as usize;
        let addr = addr as usize;
        if (start..start + self.len).contains(&addr) {
            Some(addr - start)
        } else {
            None
        }
    }

    /// Whether a host address points at live emitted code.
    pub fn contains(&self, addr: *const u8) -> bool {
        matches!(self.offset_of(addr), Some(off) if off < self.cursor)
    }

    // -- Appending --

    /// Reserve `n` bytes at the cursor and return where they start.
    /// Exhaustion here means a translator overran its size bound and
    /// is unrecoverable.
    #[inline]
    fn bump(&mut self, n: usize) -> *mut u8 {
        assert!(self.cursor + n <= self.len, "out of code buffer space");
        // SAFETY: the reserved range is within the mapping.
        let at = unsafe { self.base.add(self.cursor) };
        self.cursor += n;
        at
    }

    #[inline]
    pub fn emit_u8(&mut self, val: u8) {
        // SAFETY: bump reserved one mapped byte.
        unsafe { self.bump(1).write(val) };
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        // SAFETY: bump reserved four mapped bytes; rel32 and immediate
        // fields are not naturally aligned in x86 code.
        unsafe { (self.bump(4) as *mut u32).write_unaligned(val) };
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        // SAFETY: bump reserved eight mapped bytes.
        unsafe { (self.bump(8) as *mut u64).write_unaligned(val) };
    }

    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        let at = self.bump(bytes.len());
        // SAFETY: bump reserved the whole range; `bytes` cannot
        // overlap the mapping.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), at, bytes.len()) };
    }

    // -- Reading back --

    /// Opcode byte at an offset.
    #[inline]
    pub fn read_u8(&self, offset: usize) -> u8 {
        assert!(offset < self.len);
        // SAFETY: offset is within the mapping.
        unsafe { self.base.add(offset).read() }
    }

    /// A rel32 or immediate field at an offset (unaligned).
    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.len);
        // SAFETY: the range is within the mapping.
        unsafe { (self.base.add(offset) as *const u32).read_unaligned() }
    }

    /// Everything emitted so far, thunks included.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: base..base+cursor has been written.
        unsafe { std::slice::from_raw_parts(self.base, self.cursor) }
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        if !self.base.is_null() {
            // SAFETY: unmapping the mapping created in `new`; no
            // execution is in flight at teardown.
            unsafe {
                libc::munmap(self.base.cast(), self.len);
            }
        }
    }
}

fn round_to_page(size: usize) -> usize {
    // SAFETY: sysconf is always safe to call.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    size.div_ceil(page) * page
}
