//! Kernel GDT and the segment selectors handed to new tasks.
//!
//! Tasks share ring 0 and one flat address space, so the table holds just
//! the null descriptor and a flat code/data pair.

use core::arch::asm;
use core::cell::UnsafeCell;
use core::mem::size_of_val;
use core::sync::atomic::{AtomicBool, Ordering};

pub const GDT_ENTRY_COUNT: usize = 3;

pub const KERNEL_CODE_SELECTOR: u16 = 1 << 3;
pub const KERNEL_DATA_SELECTOR: u16 = 2 << 3;

/// Present, non-system, read/write.
const ACCESS_DATA: u8 = 0x92;
/// `ACCESS_DATA` plus executable.
const ACCESS_CODE: u8 = ACCESS_DATA | 0x08;
/// Flags nibble with only the L (64-bit code) bit.
const FLAG_LONG_MODE: u8 = 0x20;

/// `cs`/`ss` pair stored into freshly built task snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSelectors {
    pub code: u16,
    pub data: u16,
}

impl SegmentSelectors {
    pub const KERNEL: Self = Self {
        code: KERNEL_CODE_SELECTOR,
        data: KERNEL_DATA_SELECTOR,
    };
}

struct Table(UnsafeCell<[u64; GDT_ENTRY_COUNT]>);

// SAFETY: written only by `init`, on one CPU with IF clear.
unsafe impl Sync for Table {}

static GDT: Table = Table(UnsafeCell::new([0; GDT_ENTRY_COUNT]));
static LOADED: AtomicBool = AtomicBool::new(false);

/// Long-mode code or data descriptor with base and limit 0. `flags` is the
/// high nibble of the granularity byte.
pub const fn flat_descriptor(access: u8, flags: u8) -> u64 {
    (access as u64) << 40 | ((flags & 0xF0) as u64) << 48
}

/// Builds and loads the table, then reloads the data segment registers.
/// Calling it again rebuilds the same table.
pub fn init() {
    // SAFETY:
    // - Only `init` mutates the table and it runs before interrupts are on.
    // - `cs` keeps 0x08 from the boot loader, which indexes an identical
    //   flat code descriptor here.
    unsafe {
        let table = &mut *GDT.0.get();
        *table = [
            0,
            flat_descriptor(ACCESS_CODE, FLAG_LONG_MODE),
            flat_descriptor(ACCESS_DATA, 0),
        ];

        #[repr(C, packed)]
        struct Pointer {
            limit: u16,
            base: u64,
        }
        let pointer = Pointer {
            limit: (size_of_val(table) - 1) as u16,
            base: table.as_ptr() as u64,
        };

        asm!(
            "lgdt [{ptr}]",
            "mov ds, {sel:x}",
            "mov es, {sel:x}",
            "mov fs, {sel:x}",
            "mov gs, {sel:x}",
            "mov ss, {sel:x}",
            ptr = in(reg) &pointer,
            sel = in(reg) KERNEL_DATA_SELECTOR,
            options(readonly, nostack, preserves_flags)
        );
    }
    LOADED.store(true, Ordering::Release);
}

pub fn is_initialized() -> bool {
    LOADED.load(Ordering::Acquire)
}

pub fn selectors() -> SegmentSelectors {
    SegmentSelectors::KERNEL
}

pub fn current_code_selector() -> u16 {
    let cs: u16;
    // SAFETY: reading `cs` has no side effects.
    unsafe { asm!("mov {:x}, cs", out(reg) cs, options(nomem, nostack, preserves_flags)) };
    cs
}

/// Copy of the loaded descriptors.
pub fn descriptor_snapshot() -> [u64; GDT_ENTRY_COUNT] {
    // SAFETY: a by-value copy of a table only `init` writes.
    unsafe { *GDT.0.get() }
}
