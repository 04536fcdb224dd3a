//! IDT setup and Rust-side trap dispatch.
//!
//! Every trap stub builds the same [`RegisterSnapshot`] on the interrupted
//! stack, hands a pointer to Rust, and resumes whatever snapshot Rust returns.
//! Returning a different pointer than the one received is how the scheduler
//! switches tasks.

use core::arch::asm;
use core::cell::UnsafeCell;
use core::fmt::{self, Write};
use core::mem::size_of;

use crate::arch::gdt;
use crate::arch::pic::{self, IRQ_BASE};

pub use crate::arch::pic::{init_periodic_timer, pit_divisor_for_hz};

pub const IRQ0_PIT_TIMER_VECTOR: u8 = IRQ_BASE;
/// Master line 7 and slave line 7: where the 8259 delivers spurious IRQs.
const IRQ7_SPURIOUS_VECTOR: u8 = IRQ_BASE + 7;
const IRQ15_SPURIOUS_VECTOR: u8 = IRQ_BASE + 15;
pub const SYSCALL_INT80_VECTOR: u8 = 0x80;
pub const EXCEPTION_DIVIDE_ERROR: u8 = 0;
pub const EXCEPTION_INVALID_OPCODE: u8 = 6;
pub const EXCEPTION_DOUBLE_FAULT: u8 = 8;
pub const EXCEPTION_GENERAL_PROTECTION: u8 = 13;
pub const EXCEPTION_PAGE_FAULT: u8 = 14;

/// RFLAGS bit 9: interrupt enable.
pub const RFLAGS_IF: u64 = 1 << 9;

/// RFLAGS bit 1: reserved, always 1.
pub const RFLAGS_RESERVED: u64 = 1 << 1;

/// Machine state captured at a trap boundary.
///
/// Layout contract:
/// - `r15..rax` are pushed by the stubs (rax first, so r15 ends lowest).
/// - `error_code` is pushed by the CPU for some exceptions and as a zero
///   placeholder by every other stub.
/// - `rip..ss` is the frame the CPU pushes on entry and `iretq` pops.
/// - Any change requires synchronized updates in `interrupts_stubs.rs` and
///   the layout tests.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Number of general-purpose registers saved by the stubs.
pub const SNAPSHOT_GPR_COUNT: usize = 15;

/// Byte offset of `error_code` inside [`RegisterSnapshot`].
pub const SNAPSHOT_ERROR_CODE_OFFSET: usize = SNAPSHOT_GPR_COUNT * size_of::<u64>();

#[path = "interrupts_stubs.rs"]
mod interrupts_stubs;

extern "C" {
    fn irq0_pit_timer_stub();
    fn irq7_spurious_stub();
    fn irq15_spurious_stub();
    fn isr0_divide_by_zero_stub();
    fn isr6_invalid_opcode_stub();
    fn isr8_double_fault_stub();
    fn isr13_general_protection_fault_stub();
    fn isr14_page_fault_stub();
    fn int80_syscall_stub();
}

/// 64-bit IDT gate descriptor.
#[repr(C)]
#[derive(Clone, Copy)]
struct Gate {
    offset_0_15: u16,
    selector: u16,
    options: u16,
    offset_16_31: u16,
    offset_32_63: u32,
    reserved: u32,
}

impl Gate {
    const ABSENT: Self = Self {
        offset_0_15: 0,
        selector: 0,
        options: 0,
        offset_16_31: 0,
        offset_32_63: 0,
        reserved: 0,
    };

    /// Present, DPL 0, 64-bit interrupt gate (IF cleared on entry).
    const INTERRUPT_GATE: u16 = 0x8E00;

    fn interrupt(stub: unsafe extern "C" fn()) -> Self {
        let addr = stub as usize as u64;
        Self {
            offset_0_15: addr as u16,
            selector: gdt::KERNEL_CODE_SELECTOR,
            options: Self::INTERRUPT_GATE,
            offset_16_31: (addr >> 16) as u16,
            offset_32_63: (addr >> 32) as u32,
            reserved: 0,
        }
    }
}

const VECTORS: usize = 256;

/// Handler for one IRQ vector. Returns the snapshot to resume.
pub type IrqHandler = fn(u8, &mut RegisterSnapshot) -> *mut RegisterSnapshot;

struct Tables {
    idt: UnsafeCell<[Gate; VECTORS]>,
    irq_handlers: UnsafeCell<[Option<IrqHandler>; 16]>,
}

// SAFETY:
// - Single CPU. Both tables are only written with IF clear, and the handler
//   table is only read from trap context where IF is clear as well.
unsafe impl Sync for Tables {}

static TABLES: Tables = Tables {
    idt: UnsafeCell::new([Gate::ABSENT; VECTORS]),
    irq_handlers: UnsafeCell::new([None; 16]),
};

/// Loads the IDT, remaps the PIC and forgets all IRQ handlers.
/// Interrupts are left disabled.
pub fn init() {
    disable();

    let gates: [(u8, unsafe extern "C" fn()); 9] = [
        (EXCEPTION_DIVIDE_ERROR, isr0_divide_by_zero_stub),
        (EXCEPTION_INVALID_OPCODE, isr6_invalid_opcode_stub),
        (EXCEPTION_DOUBLE_FAULT, isr8_double_fault_stub),
        (EXCEPTION_GENERAL_PROTECTION, isr13_general_protection_fault_stub),
        (EXCEPTION_PAGE_FAULT, isr14_page_fault_stub),
        (IRQ0_PIT_TIMER_VECTOR, irq0_pit_timer_stub),
        (IRQ7_SPURIOUS_VECTOR, irq7_spurious_stub),
        (IRQ15_SPURIOUS_VECTOR, irq15_spurious_stub),
        (SYSCALL_INT80_VECTOR, int80_syscall_stub),
    ];

    // SAFETY:
    // - IF is clear and nothing else references the tables yet.
    // - `lidt` gets a descriptor for a table with static lifetime.
    unsafe {
        let idt = &mut *TABLES.idt.get();
        for (vector, stub) in gates {
            idt[vector as usize] = Gate::interrupt(stub);
        }
        *TABLES.irq_handlers.get() = [None; 16];

        #[repr(C, packed)]
        struct Descriptor {
            limit: u16,
            base: u64,
        }
        let descriptor = Descriptor {
            limit: (size_of::<[Gate; VECTORS]>() - 1) as u16,
            base: idt.as_ptr() as u64,
        };
        asm!("lidt [{}]", in(reg) &descriptor, options(readonly, nostack, preserves_flags));
    }

    pic::init();
}

pub fn enable() {
    // SAFETY: `sti` only sets IF.
    unsafe { asm!("sti", options(nomem, nostack, preserves_flags)) };
}

pub fn disable() {
    // SAFETY: `cli` only clears IF.
    unsafe { asm!("cli", options(nomem, nostack, preserves_flags)) };
}

#[inline]
pub fn are_enabled() -> bool {
    let rflags: u64;
    // SAFETY: `pushfq; pop` reads RFLAGS without changing it.
    unsafe { asm!("pushfq", "pop {}", out(reg) rflags, options(nomem, preserves_flags)) };
    rflags & RFLAGS_IF != 0
}

/// Installs `handler` for an IRQ vector (`IRQ_BASE..IRQ_BASE + 16`).
/// Other vectors are ignored.
pub fn register_irq_handler(vector: u8, handler: IrqHandler) {
    let Some(irq) = vector.checked_sub(IRQ_BASE).filter(|irq| *irq < 16) else {
        return;
    };
    let were_enabled = are_enabled();
    disable();
    // SAFETY: IF is clear, so no trap reads the table concurrently.
    unsafe { (*TABLES.irq_handlers.get())[irq as usize] = Some(handler) };
    if were_enabled {
        enable();
    }
}

/// CPU exceptions that push an error code before entering the handler.
pub const fn exception_has_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10..=14 | 17 | 21 | 29 | 30)
}

/// `fmt::Write` sink painting white-on-red cells into the top VGA row.
/// Bypasses the screen lock, which the faulting code may hold.
struct PanicRow {
    col: usize,
}

impl Write for PanicRow {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        const VGA_ROW0: usize = 0xFFFF_8000_000B_8000;
        for byte in s.bytes().take(80usize.saturating_sub(self.col)) {
            let cell = (VGA_ROW0 + self.col * 2) as *mut u16;
            // SAFETY: `col < 80` keeps the write inside the first text row.
            unsafe { cell.write_volatile(0x4F00 | byte as u16) };
            self.col += 1;
        }
        Ok(())
    }
}

/// Reports a fatal exception on serial and screen, then halts for good.
///
/// # Safety
/// - `frame` must point at the snapshot built by an exception stub.
#[no_mangle]
pub unsafe extern "C" fn exception_handler_rust(vector: u8, frame: *const RegisterSnapshot) -> ! {
    // SAFETY: the stub passes the snapshot it just pushed.
    let frame = unsafe { &*frame };
    crate::drivers::serial::_debug_print(format_args!(
        "FATAL EXCEPTION vec={:#04x} err={:#x} rip={:#018x} cs={:#x} rflags={:#x} rsp={:#018x}\n",
        vector, frame.error_code, frame.rip, frame.cs, frame.rflags, frame.rsp
    ));
    let _ = write!(
        PanicRow { col: 0 },
        "!! EXC {:#04x} err={:#x} rip={:#x}",
        vector,
        frame.error_code,
        frame.rip
    );

    loop {
        // SAFETY: halts with interrupts off.
        unsafe { asm!("cli", "hlt", options(nomem, nostack, preserves_flags)) };
    }
}

/// Entry point of the IRQ stubs.
///
/// # Safety
/// - Called from an IRQ stub only, with IF clear.
/// - `frame` points at the snapshot the stub just pushed.
#[no_mangle]
pub unsafe extern "C" fn irq_rust_dispatch(
    vector: u8,
    frame: *mut RegisterSnapshot,
) -> *mut RegisterSnapshot {
    let Some(irq) = vector.checked_sub(IRQ_BASE).filter(|irq| *irq < 16) else {
        return frame;
    };

    if pic::is_spurious(irq) {
        // The master still expects an EOI for the cascade line.
        if irq >= 8 {
            pic::end_of_interrupt(0);
        }
        return frame;
    }

    // SAFETY: handler slots are written with IF clear only.
    let next = match unsafe { (*TABLES.irq_handlers.get())[irq as usize] } {
        // SAFETY: `frame` stays on the interrupted stack until the stub
        // resumes from whatever pointer is returned.
        Some(handler) => handler(vector, unsafe { &mut *frame }),
        None => frame,
    };
    pic::end_of_interrupt(irq);
    next
}

/// Entry point of the `int 0x80` stub.
///
/// # Safety
/// - Called from `int80_syscall_stub` only.
/// - `frame` points at the snapshot on the calling stack.
#[no_mangle]
pub unsafe extern "C" fn syscall_rust_dispatch(frame: *mut RegisterSnapshot) -> *mut RegisterSnapshot {
    crate::syscall::dispatch(frame)
}

const _: () = {
    assert!(size_of::<RegisterSnapshot>() == 21 * 8);
    assert!(SNAPSHOT_ERROR_CODE_OFFSET == 120);
    assert!(size_of::<Gate>() == 16);
};
