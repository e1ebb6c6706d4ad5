//! Register address map of the on-device emulation controller.
//!
//! These constants are consumed from the RTL transformation toolchain; the
//! device guarantees that register operations take effect in issue order.

use bitflags::bitflags;

pub const EMU_CTRL_BASE: u32 = 0x0_0000;
pub const DPI_REGFILE_BASE: u32 = 0x1_0000;
pub const SCAN_CTRL_BASE: u32 = 0x2_0000;
pub const MEM_CTRL_BASE: u32 = 0x3_0000;

/// Version of this shell, major in the high half, minor in the low half.
/// Compared against the device-reported version at connect time.
pub const SHELL_VERSION: u32 = 0x0001_0000;

/// Emulation control block.
pub mod emu {
    use super::EMU_CTRL_BASE;

    pub const STATUS: u32 = EMU_CTRL_BASE + 0x00;
    pub const COMMAND: u32 = EMU_CTRL_BASE + 0x04;
    pub const CYCLE_LO: u32 = EMU_CTRL_BASE + 0x08;
    pub const CYCLE_HI: u32 = EMU_CTRL_BASE + 0x0C;
    pub const TIME_LO: u32 = EMU_CTRL_BASE + 0x10;
    pub const TIME_HI: u32 = EMU_CTRL_BASE + 0x14;
    pub const TIME_CMP_LO: u32 = EMU_CTRL_BASE + 0x18;
    pub const TIME_CMP_HI: u32 = EMU_CTRL_BASE + 0x1C;
    pub const FINISH: u32 = EMU_CTRL_BASE + 0x20;
    /// 8 words; word 7 is the most significant word of the rendered hash.
    pub const DESIGN_HASH: u32 = EMU_CTRL_BASE + 0x40;
    pub const N_DPI_FUNCS: u32 = EMU_CTRL_BASE + 0x60;
    pub const MAX_DPI_ARGS: u32 = EMU_CTRL_BASE + 0x64;
    pub const SCAN_CHAIN_LENGTH: u32 = EMU_CTRL_BASE + 0x68;
    pub const N_MEMORIES: u32 = EMU_CTRL_BASE + 0x6C;
    pub const SHELL_VERSION: u32 = EMU_CTRL_BASE + 0x70;
    pub const DECOUPLE_CTRL: u32 = EMU_CTRL_BASE + 0x74;
    pub const DECOUPLE_STAT: u32 = EMU_CTRL_BASE + 0x78;

    pub const CMD_START: u32 = 1;
    pub const CMD_STOP: u32 = 2;
    pub const CMD_RESET: u32 = 3;

    pub fn hash_word(index: u32) -> u32 {
        debug_assert!(index < 8);
        DESIGN_HASH + 4 * index
    }

    /// Finish register layout: bit 0 requests finish, bits [15:8] carry the
    /// exit code. The same register is written by a design-initiated finish.
    pub fn finish_word(exit_code: i32) -> u32 {
        1 | ((exit_code as u32 & 0xFF) << 8)
    }
}

/// Per-function DPI register file: one 64-byte block per function, plus the
/// reserved pending-mask word at the top of the region.
pub mod dpi {
    use super::DPI_REGFILE_BASE;

    pub const BLOCK_STRIDE: u32 = 64;
    /// Arg slots run from 0x08 to the results at 0x38.
    pub const MAX_ARG_SLOTS: u32 = 12;
    /// Bit N reads 1 while function N is pending-and-not-done.
    pub const PENDING: u32 = DPI_REGFILE_BASE + 0xFFC0;

    fn block(func_id: u32) -> u32 {
        DPI_REGFILE_BASE + func_id * BLOCK_STRIDE
    }

    pub fn status(func_id: u32) -> u32 {
        block(func_id)
    }

    pub fn control(func_id: u32) -> u32 {
        block(func_id) + 0x04
    }

    pub fn arg(func_id: u32, index: u32) -> u32 {
        debug_assert!(index < MAX_ARG_SLOTS);
        block(func_id) + 0x08 + 4 * index
    }

    pub fn result_lo(func_id: u32) -> u32 {
        block(func_id) + 0x38
    }

    pub fn result_hi(func_id: u32) -> u32 {
        block(func_id) + 0x3C
    }
}

/// Scan-chain controller.
pub mod scan {
    use super::SCAN_CTRL_BASE;

    pub const COMMAND: u32 = SCAN_CTRL_BASE + 0x00;
    /// Host clears, device sets on completion.
    pub const DONE: u32 = SCAN_CTRL_BASE + 0x04;
    pub const DATA: u32 = SCAN_CTRL_BASE + 0x1000;

    pub const CMD_CAPTURE: u32 = 1;
    pub const CMD_RESTORE: u32 = 2;

    pub fn data_word(index: u32) -> u32 {
        DATA + 4 * index
    }
}

/// Memory-shadow controller.
pub mod mem {
    use super::MEM_CTRL_BASE;

    pub const COMMAND: u32 = MEM_CTRL_BASE + 0x00;
    pub const DONE: u32 = MEM_CTRL_BASE + 0x04;
    pub const MEM_SELECT: u32 = MEM_CTRL_BASE + 0x08;
    pub const ENTRY_ADDR_LO: u32 = MEM_CTRL_BASE + 0x0C;
    pub const ENTRY_ADDR_HI: u32 = MEM_CTRL_BASE + 0x10;
    pub const DATA: u32 = MEM_CTRL_BASE + 0x1000;

    pub const CMD_READ: u32 = 1;
    pub const CMD_WRITE: u32 = 2;
    pub const CMD_PRELOAD_START: u32 = 3;
    pub const CMD_PRELOAD_NEXT: u32 = 4;

    pub fn data_word(index: u32) -> u32 {
        DATA + 4 * index
    }
}

bitflags! {
    /// Per-function CONTROL register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DpiControl: u32 {
        const SET_DONE = 1 << 0;
        const SET_ERROR = 1 << 1;
    }
}

/// Emulation state, read from STATUS bits [2:0]. Unknown encodings decode
/// to `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmuState {
    Idle,
    Running,
    Frozen,
    Snapshot,
    Restore,
    Error,
}

impl EmuState {
    pub fn from_status(status: u32) -> EmuState {
        match status & 0x7 {
            0 => EmuState::Idle,
            1 => EmuState::Running,
            2 => EmuState::Frozen,
            3 => EmuState::Snapshot,
            4 => EmuState::Restore,
            _ => EmuState::Error,
        }
    }
}
