//! Legacy 8259 PIC pair and PIT channel 0.

use crate::arch::port::PortByte;

/// First vector used for remapped IRQ lines.
pub const IRQ_BASE: u8 = 32;

const MASTER_COMMAND: PortByte = PortByte::new(0x20);
const MASTER_DATA: PortByte = PortByte::new(0x21);
const SLAVE_COMMAND: PortByte = PortByte::new(0xA0);
const SLAVE_DATA: PortByte = PortByte::new(0xA1);
/// POST diagnostic port; writing it costs about one microsecond.
const DELAY: PortByte = PortByte::new(0x80);

const ICW1_INIT_WITH_ICW4: u8 = 0x11;
const ICW4_8086_MODE: u8 = 0x01;
const OCW2_EOI: u8 = 0x20;
const OCW3_READ_ISR: u8 = 0x0B;

const PIT_COMMAND: PortByte = PortByte::new(0x43);
const PIT_CHANNEL0: PortByte = PortByte::new(0x40);
/// Channel 0, lobyte/hibyte, mode 3 (square wave).
const PIT_SQUARE_WAVE: u8 = 0x36;
const PIT_INPUT_HZ: u32 = 1_193_182;

fn write_slow(port: PortByte, value: u8) {
    // SAFETY: only PIC ports are passed in, during initialization.
    unsafe {
        port.write(value);
        DELAY.write(0);
    }
}

/// Remaps both PICs to `IRQ_BASE..IRQ_BASE + 16` and leaves only IRQ0
/// unmasked.
pub fn init() {
    write_slow(MASTER_COMMAND, ICW1_INIT_WITH_ICW4);
    write_slow(SLAVE_COMMAND, ICW1_INIT_WITH_ICW4);
    write_slow(MASTER_DATA, IRQ_BASE);
    write_slow(SLAVE_DATA, IRQ_BASE + 8);
    // Slave on master line 2.
    write_slow(MASTER_DATA, 1 << 2);
    write_slow(SLAVE_DATA, 2);
    write_slow(MASTER_DATA, ICW4_8086_MODE);
    write_slow(SLAVE_DATA, ICW4_8086_MODE);

    write_slow(MASTER_DATA, !1);
    write_slow(SLAVE_DATA, 0xFF);
}

/// Acknowledges `irq`; slave lines need both controllers.
pub fn end_of_interrupt(irq: u8) {
    // SAFETY: OCW2 non-specific EOI.
    unsafe {
        if irq >= 8 {
            SLAVE_COMMAND.write(OCW2_EOI);
        }
        MASTER_COMMAND.write(OCW2_EOI);
    }
}

/// Whether IRQ7 or IRQ15 fired without its in-service bit set.
pub fn is_spurious(irq: u8) -> bool {
    let command = match irq {
        7 => MASTER_COMMAND,
        15 => SLAVE_COMMAND,
        _ => return false,
    };
    // SAFETY: OCW3 selects the ISR for the next command-port read.
    let in_service = unsafe {
        command.write(OCW3_READ_ISR);
        command.read()
    };
    in_service & (1 << 7) == 0
}

/// PIT reload value for `hz`, clamped to the 16-bit counter. 0 for `hz == 0`.
pub const fn pit_divisor_for_hz(hz: u32) -> u16 {
    match hz {
        0 => 0,
        _ => {
            let divisor = PIT_INPUT_HZ / hz;
            if divisor == 0 {
                1
            } else if divisor > u16::MAX as u32 {
                u16::MAX
            } else {
                divisor as u16
            }
        }
    }
}

/// Starts channel 0 firing IRQ0 at roughly `hz`. Ignored for `hz == 0`.
pub fn init_periodic_timer(hz: u32) {
    let [low, high] = match pit_divisor_for_hz(hz) {
        0 => return,
        divisor => divisor.to_le_bytes(),
    };
    // SAFETY: programs channel 0 only.
    unsafe {
        PIT_COMMAND.write(PIT_SQUARE_WAVE);
        PIT_CHANNEL0.write(low);
        PIT_CHANNEL0.write(high);
    }
}
