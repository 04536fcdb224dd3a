use core::arch::global_asm;

use super::{
    EXCEPTION_DIVIDE_ERROR, EXCEPTION_DOUBLE_FAULT, EXCEPTION_GENERAL_PROTECTION,
    EXCEPTION_INVALID_OPCODE, EXCEPTION_PAGE_FAULT, IRQ0_PIT_TIMER_VECTOR,
    IRQ15_SPURIOUS_VECTOR, IRQ7_SPURIOUS_VECTOR,
};

// Every stub leaves the same picture on the stack before calling into Rust:
//
//   [rsp + 160]  ss          (CPU)
//   [rsp + 152]  rsp         (CPU)
//   [rsp + 144]  rflags      (CPU)
//   [rsp + 136]  cs          (CPU)
//   [rsp + 128]  rip         (CPU)
//   [rsp + 120]  error code  (CPU, or 0 pushed by the stub)
//   [rsp + 112]  rax
//   ...
//   [rsp +   0]  r15
//
// which is exactly `RegisterSnapshot`. Resumable stubs switch to whatever
// snapshot Rust returns in rax, pop it and drop the error code slot before
// `iretq`. The snapshot is never assumed to be on the stack we entered on.

macro_rules! save_snapshot_gprs {
    () => {
        "    push rax\n    push rcx\n    push rdx\n    push rbx\n    push rbp\n    push rsi\n    push rdi\n    push r8\n    push r9\n    push r10\n    push r11\n    push r12\n    push r13\n    push r14\n    push r15\n"
    };
}

macro_rules! resume_snapshot {
    () => {
        "    mov rsp, rax\n    pop r15\n    pop r14\n    pop r13\n    pop r12\n    pop r11\n    pop r10\n    pop r9\n    pop r8\n    pop rdi\n    pop rsi\n    pop rbp\n    pop rbx\n    pop rdx\n    pop rcx\n    pop rax\n    add rsp, 8\n    iretq\n"
    };
}

macro_rules! stub_label {
    ($name:ident) => {
        concat!(
            ".section .text\n.global ",
            stringify!($name),
            "\n.type ",
            stringify!($name),
            ", @function\n",
            stringify!($name),
            ":\n    cli\n"
        )
    };
}

/// Resumable IRQ stub: `irq_rust_dispatch(vector, snapshot)`.
macro_rules! irq_stub {
    ($name:ident, $vector:expr) => {
        global_asm!(
            concat!(
                stub_label!($name),
                "    push 0\n",
                save_snapshot_gprs!(),
                "    mov edi, {vector}\n    mov rsi, rsp\n    and rsp, -16\n    call irq_rust_dispatch\n",
                resume_snapshot!(),
            ),
            vector = const $vector,
        );
    };
}

/// Fatal exception stub. `$placeholder` pushes the error code slot for
/// vectors where the CPU does not.
macro_rules! exception_stub {
    ($name:ident, $vector:expr, $placeholder:literal) => {
        global_asm!(
            concat!(
                stub_label!($name),
                $placeholder,
                save_snapshot_gprs!(),
                "    mov edi, {vector}\n    mov rsi, rsp\n    and rsp, -16\n    call exception_handler_rust\n",
                "1:\n    cli\n    hlt\n    jmp 1b\n",
            ),
            vector = const $vector,
        );
    };
}

irq_stub!(irq0_pit_timer_stub, IRQ0_PIT_TIMER_VECTOR);
irq_stub!(irq7_spurious_stub, IRQ7_SPURIOUS_VECTOR);
irq_stub!(irq15_spurious_stub, IRQ15_SPURIOUS_VECTOR);

exception_stub!(isr0_divide_by_zero_stub, EXCEPTION_DIVIDE_ERROR, "    push 0\n");
exception_stub!(isr6_invalid_opcode_stub, EXCEPTION_INVALID_OPCODE, "    push 0\n");
exception_stub!(isr8_double_fault_stub, EXCEPTION_DOUBLE_FAULT, "");
exception_stub!(isr13_general_protection_fault_stub, EXCEPTION_GENERAL_PROTECTION, "");
exception_stub!(isr14_page_fault_stub, EXCEPTION_PAGE_FAULT, "");

// `int 0x80`: the snapshot pointer is the only argument; `rax` carries the
// request code inside it.
global_asm!(concat!(
    stub_label!(int80_syscall_stub),
    "    push 0\n",
    save_snapshot_gprs!(),
    "    mov rdi, rsp\n    and rsp, -16\n    call syscall_rust_dispatch\n",
    resume_snapshot!(),
));
