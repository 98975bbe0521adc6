use std::fmt;
use std::mem;
use std::ptr;

use dbt_backend::code_buffer::CodeBuffer;
use dbt_backend::x86_64::thunks::{self, DispatchThunks, LinkageSlot, ThunkParams};
use dbt_core::{Error, Guest};
use log::{debug, trace};

use crate::code_cache::CodeCache;
use crate::edge_table::EdgeTable;

/// Worst-case host bytes for one translated block. Translation refuses
/// to start with less room than this and reports the buffer full
/// instead, so the emit primitives never hit the end of the arena
/// mid-block.
pub const MAX_BLOCK_BYTES: usize = 4096;

/// Seam to the external translation pipeline.
///
/// `translate` emits host code for the guest block starting at `pc`
/// into the buffer's current position. A block body ends by storing the
/// next guest PC to the context and transferring to one of the thunks:
/// `jmp dynamic` for an indirect branch, `call static_branch` (the
/// linkage slot) for a direct branch that wants to be linked,
/// `jmp interrupt` where a pre-dispatch interrupt check is due, or
/// `jmp exit` to leave the translated world.
///
/// A block must emit at most [`MAX_BLOCK_BYTES`]; the controller
/// guarantees that much room before calling in. On error the buffer is
/// rewound by the caller; partial emission is fine.
pub trait BlockTranslator {
    fn translate(
        &mut self,
        pc: u32,
        buf: &mut CodeBuffer,
        thunks: &DispatchThunks,
    ) -> Result<(), Error>;
}

/// Counters for the dispatch slow paths. The steady-state path (block
/// to block through patched jumps) touches none of these.
#[derive(Default)]
pub struct DispatchStats {
    pub runs: u64,
    pub compiles: u64,
    pub links: u64,
    pub unlinks: u64,
    pub invalidations: u64,
    pub flushes: u64,
}

impl fmt::Display for DispatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Dispatch Stats ===")?;
        writeln!(f, "runs:          {}", self.runs)?;
        writeln!(f, "compiles:      {}", self.compiles)?;
        writeln!(f, "links:         {}", self.links)?;
        writeln!(f, "unlinks:       {}", self.unlinks)?;
        writeln!(f, "invalidations: {}", self.invalidations)?;
        writeln!(f, "flushes:       {}", self.flushes)?;
        Ok(())
    }
}

/// Controller state shared between the host-side API and the thunk
/// upcalls. Kept behind a raw pointer with a stable address: the thunks
/// capture it as an immediate at emission time.
struct Inner<T: BlockTranslator> {
    guest: Guest,
    buf: CodeBuffer,
    cache: CodeCache,
    edges: EdgeTable,
    thunks: DispatchThunks,
    /// Buffer offset of the first block; flush rewinds to here,
    /// leaving the thunks in place.
    code_base: usize,
    translator: T,
    stats: DispatchStats,
}

/// The dispatch core of one JIT instance.
///
/// Owns the code buffer, the PC-indexed code cache, the edge table and
/// the six dispatch thunks, and services the upcalls out of them. One
/// executor thread at a time may be inside [`run`](Self::run); all
/// mutation of the code bytes, cache and edges happens from that thread
/// via upcalls, so the executor is never concurrent with modification
/// of its own code.
pub struct Jit<T: BlockTranslator> {
    inner: *mut Inner<T>,
}

impl<T: BlockTranslator> Jit<T> {
    /// Build a JIT with the default code buffer size.
    pub fn new(guest: Guest, translator: T) -> Result<Self, Error> {
        let buf = CodeBuffer::with_default_size()?;
        Self::build(guest, translator, buf)
    }

    /// Build a JIT with an explicit code buffer size.
    pub fn with_code_size(guest: Guest, translator: T, size: usize) -> Result<Self, Error> {
        let buf = CodeBuffer::new(size)?;
        Self::build(guest, translator, buf)
    }

    fn build(guest: Guest, translator: T, buf: CodeBuffer) -> Result<Self, Error> {
        guest.validate()?;
        let cache = CodeCache::new(guest.addr_mask, guest.cache_shift);
        let inner = Box::into_raw(Box::new(Inner {
            guest,
            buf,
            cache,
            edges: EdgeTable::new(),
            thunks: DispatchThunks::default(),
            code_base: 0,
            translator,
            stats: DispatchStats::default(),
        }));

        // SAFETY: `inner` is a fresh exclusive allocation; nothing else
        // can observe it until `run` executes the thunks emitted below.
        unsafe {
            let i = &mut *inner;
            let params = ThunkParams {
                guest_ctx: i.guest.ctx,
                guest_mem: i.guest.mem,
                offset_pc: i.guest.offset_pc,
                offset_cycles: i.guest.offset_cycles,
                offset_instrs: i.guest.offset_instrs,
                addr_mask: i.guest.addr_mask,
                cache_shift: i.guest.cache_shift,
                cache_base: i.cache.base_ptr(),
                controller: inner as *mut (),
                compile_block: compile_block_upcall::<T>,
                add_edge: add_edge_upcall::<T>,
                interrupt_check: i.guest.interrupt_check,
                interrupt_data: i.guest.data,
            };
            i.thunks = thunks::emit_dispatch_thunks(&mut i.buf, &params);
            i.code_base = i.buf.offset();
            let compile = i.buf.ptr_at(i.thunks.compile);
            i.cache.set_default(compile);
        }

        Ok(Self { inner })
    }

    fn inner(&self) -> &Inner<T> {
        // SAFETY: `inner` is valid until Drop and this thread is the
        // only one touching it.
        unsafe { &*self.inner }
    }

    fn inner_mut(&mut self) -> &mut Inner<T> {
        // SAFETY: as above, with &mut self guaranteeing exclusivity.
        unsafe { &mut *self.inner }
    }

    /// Enter the translated world with a cycle budget. Returns when a
    /// block has consumed the budget (or an interrupt hook redirected
    /// the guest) and transferred to the `exit` thunk.
    ///
    /// # Safety
    /// The guest contract pointers (`ctx`, `mem`, `data`) must be live
    /// and the translator must emit well-formed blocks: every block
    /// reachable from the current guest PC must terminate in one of the
    /// dispatch thunks and respect the pinned-register ABI.
    pub unsafe fn run(&mut self, cycles: i32) {
        let enter: extern "C" fn(i32) = {
            let i = &mut *self.inner;
            i.stats.runs += 1;
            // SAFETY (transmute): the enter thunk was emitted at this
            // offset with exactly this signature.
            mem::transmute(i.buf.ptr_at(i.thunks.enter))
        };
        // No reference into Inner may be live here: the call re-enters
        // the controller through the upcall trampolines.
        enter(cycles);
    }

    /// Drop any compiled code at `addr` and unlink its inbound edges.
    pub fn invalidate(&mut self, addr: u32) {
        self.inner_mut().invalidate(addr);
    }

    /// Synchronously compile (or recompile) the block at `addr`.
    pub fn compile_block(&mut self, addr: u32) {
        self.inner_mut().compile_block(addr);
    }

    /// Flush all translated code: every slot back to `compile`, edge
    /// table emptied, buffer rewound to the end of the thunks.
    /// Idempotent.
    pub fn reset(&mut self) {
        self.inner_mut().flush();
    }

    /// Current slot contents for a guest address.
    pub fn lookup(&self, addr: u32) -> *const u8 {
        self.inner().cache.lookup(addr)
    }

    /// Whether a compiled block is resident for `addr`.
    pub fn is_compiled(&self, addr: u32) -> bool {
        let i = self.inner();
        !ptr::eq(i.cache.lookup(addr), i.cache.default_entry())
    }

    /// Number of slots holding compiled blocks.
    pub fn occupied_slots(&self) -> usize {
        self.inner().cache.occupied()
    }

    pub fn cache(&self) -> &CodeCache {
        &self.inner().cache
    }

    pub fn edges(&self) -> &EdgeTable {
        &self.inner().edges
    }

    pub fn code_buffer(&self) -> &CodeBuffer {
        &self.inner().buf
    }

    pub fn thunks(&self) -> &DispatchThunks {
        &self.inner().thunks
    }

    /// Absolute address of a code buffer offset (e.g. a thunk).
    pub fn code_ptr(&self, offset: usize) -> *const u8 {
        self.inner().buf.ptr_at(offset)
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.inner().stats
    }

    pub fn translator(&self) -> &T {
        &self.inner().translator
    }

    pub fn translator_mut(&mut self) -> &mut T {
        &mut self.inner_mut().translator
    }

    /// Walk the cache/edge cross-references and abort on any breakage:
    /// every slot jumpable, every edge a direct jump to its resident
    /// destination, no sources recorded for an evicted destination.
    /// Intended for tests and post-mutation self-checks; cost is linear
    /// in the slot count.
    pub fn check_consistency(&self) {
        let i = self.inner();
        let compile = i.cache.default_entry();

        for idx in 0..i.cache.entries() {
            let entry = i.cache.entry_at(idx);
            let installed = i
                .buf
                .offset_of(entry)
                .is_some_and(|off| off >= i.code_base && off < i.buf.offset());
            assert!(
                ptr::eq(entry, compile) || installed,
                "slot {idx:#x} holds neither the compile thunk nor an installed block"
            );
        }

        for (site, dest) in i.edges.iter() {
            let entry = i.cache.lookup(dest);
            assert!(
                !ptr::eq(entry, compile),
                "edge into evicted destination {dest:#010x}"
            );
            // SAFETY: recorded sites point at linkage slots inside the
            // live code buffer.
            let slot = unsafe { thunks::read_slot(site as *const u8) };
            assert!(
                slot == LinkageSlot::Jump(entry),
                "site {site:#x} does not jump to the block at {dest:#010x}"
            );
        }

        for dest in i.edges.destinations() {
            assert!(
                !ptr::eq(i.cache.lookup(dest), compile),
                "sources recorded for uncompiled destination {dest:#010x}"
            );
        }
    }
}

impl<T: BlockTranslator> Drop for Jit<T> {
    fn drop(&mut self) {
        // SAFETY: `inner` came from Box::into_raw in `build` and is
        // dropped exactly once; no execution is in flight.
        unsafe { drop(Box::from_raw(self.inner)) };
    }
}

impl<T: BlockTranslator> Inner<T> {
    /// Upcall target of the `compile` thunk, and the recompile service.
    fn compile_block(&mut self, pc: u32) {
        let pc = pc & self.guest.addr_mask;

        // Recompilation, or an alias evicting the previous occupant:
        // unlink its inbound edges before the slot changes hands.
        if !ptr::eq(self.cache.lookup(pc), self.cache.default_entry()) {
            self.invalidate(pc);
        }

        if let Err(first) = self.translate_and_install(pc) {
            if !matches!(first, Error::BufferFull { .. }) {
                panic!("block translation failed: {first}");
            }
            // Arena exhausted: drop every block and translate into the
            // emptied buffer.
            debug!(
                "code buffer full ({} bytes left) compiling {pc:#010x}, flushing",
                self.buf.remaining()
            );
            self.flush();
            if let Err(err) = self.translate_and_install(pc) {
                // Returning with the slot still holding `compile`
                // would re-enter it and loop.
                panic!("block translation failed after flush: {err}");
            }
        }

        self.stats.compiles += 1;
        trace!("compiled block {pc:#010x}");
    }

    fn translate_and_install(&mut self, pc: u32) -> Result<(), Error> {
        if self.buf.remaining() < MAX_BLOCK_BYTES {
            return Err(Error::BufferFull { pc });
        }
        let start = self.buf.offset();
        let entry = self.buf.current_ptr();
        match self.translator.translate(pc, &mut self.buf, &self.thunks) {
            Ok(()) => {
                self.cache.install(pc, entry);
                Ok(())
            }
            Err(err) => {
                self.buf.set_offset(start);
                Err(err)
            }
        }
    }

    /// Upcall target of the `static` thunk. Links on the traversal that
    /// finds the destination resident, so a patched jump always targets
    /// real block code, never the `compile` thunk.
    fn add_edge(&mut self, site: *mut u8, dest: u32) {
        let dest = dest & self.guest.addr_mask;
        let site_key = site as usize;

        if self.edges.destination_of(site_key) == Some(dest) {
            // Already linked; a patched site no longer calls here.
            return;
        }

        let entry = self.cache.lookup(dest);
        if ptr::eq(entry, self.cache.default_entry()) {
            // Destination not resident yet. Leave the slot calling the
            // static thunk; a later traversal links it.
            return;
        }

        // SAFETY: `site` is the linkage slot whose call just entered
        // the static thunk; the executor is in this upcall, not in the
        // slot bytes.
        unsafe { thunks::patch_edge(site, entry) };
        self.edges.record(site_key, dest);
        self.stats.links += 1;
        trace!("linked site {site:p} -> {dest:#010x}");
    }

    fn invalidate(&mut self, addr: u32) {
        let pc = addr & self.guest.addr_mask;
        let static_branch = self.buf.ptr_at(self.thunks.static_branch);

        // Unlink inbound edges before the slot changes hands: a still
        // linked site must never target code the cache no longer
        // reaches.
        for site in self.edges.drain_sources(pc) {
            // SAFETY: recorded sites are linkage slots in the live
            // buffer; the executor is not inside them (see `run`).
            unsafe { thunks::restore_edge(site as *mut u8, static_branch) };
            self.stats.unlinks += 1;
        }

        self.cache.invalidate(pc);
        self.stats.invalidations += 1;
        debug!("invalidated {pc:#010x}");
    }

    /// Drop every translated block. The thunks survive: they sit below
    /// `code_base` and embed only addresses that a flush keeps stable.
    fn flush(&mut self) {
        self.edges.clear();
        self.cache.reset();
        self.buf.set_offset(self.code_base);
        self.stats.flushes += 1;
        debug!("flushed all translated code");
    }
}

unsafe extern "C" fn compile_block_upcall<T: BlockTranslator>(controller: *mut (), pc: u32) {
    // SAFETY: the thunks pass back the Inner pointer they were emitted
    // with; the executor thread owns it for the duration of `run`.
    let inner = &mut *(controller as *mut Inner<T>);
    inner.compile_block(pc);
}

unsafe extern "C" fn add_edge_upcall<T: BlockTranslator>(
    controller: *mut (),
    site: *mut u8,
    pc: u32,
) {
    // SAFETY: as above.
    let inner = &mut *(controller as *mut Inner<T>);
    inner.add_edge(site, pc);
}
