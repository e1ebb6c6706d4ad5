//! Typed operations over the design's register file.
//!
//! A `Context` owns exactly one transport. `connect()` caches the design
//! info block (function counts, chain length, hash) that every later
//! operation needs; all other state lives on the peer.

use std::thread;
use std::time::Duration;

use log::info;
use smallvec::SmallVec;

use crate::error::{HostError, HostResult};
use crate::regmap::{dpi, emu, mem, scan, DpiControl, EmuState};
use crate::scan::chain_words;
use crate::transport::Transport;

/// Default argument-slot count when the device advertises zero.
pub const DEFAULT_MAX_DPI_ARGS: u32 = 8;

/// Poll interval for scan/memory completion waits.
const POLL_INTERVAL_MS: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesignInfo {
    pub n_dpi_funcs: u32,
    pub max_dpi_args: u32,
    /// Scan chain length in bits.
    pub scan_chain_length: u32,
    pub n_memories: u32,
    /// Device-reported shell version, major in the high half.
    pub shell_version: u32,
    pub design_hash: [u32; 8],
}

impl DesignInfo {
    /// Lowercase 64-hex rendering, word 7 as the most significant word.
    pub fn hash_hex(&self) -> String {
        self.design_hash.iter().rev().map(|w| format!("{w:08x}")).collect()
    }
}

/// One pending foreign call, captured by reading every argument slot.
#[derive(Debug, Clone)]
pub struct DpiCall {
    pub func_id: u32,
    pub args: SmallVec<[u32; 8]>,
}

pub struct Context {
    transport: Box<dyn Transport>,
    info: Option<DesignInfo>,
}

impl Context {
    pub fn new(transport: Box<dyn Transport>) -> Context {
        Context { transport, info: None }
    }

    /// Connects the transport and reads the design info block once.
    pub fn connect(&mut self) -> HostResult<()> {
        self.transport.connect()?;
        let n_dpi_funcs = self.read32(emu::N_DPI_FUNCS)?;
        let mut max_dpi_args = self.read32(emu::MAX_DPI_ARGS)?;
        if max_dpi_args == 0 {
            max_dpi_args = DEFAULT_MAX_DPI_ARGS;
        }
        if max_dpi_args > dpi::MAX_ARG_SLOTS {
            return Err(HostError::Protocol(format!(
                "device advertises {max_dpi_args} DPI args but the register file holds {}",
                dpi::MAX_ARG_SLOTS
            )));
        }
        let scan_chain_length = self.read32(emu::SCAN_CHAIN_LENGTH)?;
        let n_memories = self.read32(emu::N_MEMORIES)?;
        let shell_version = self.read32(emu::SHELL_VERSION)?;
        let mut design_hash = [0u32; 8];
        for (i, word) in design_hash.iter_mut().enumerate() {
            *word = self.read32(emu::hash_word(i as u32))?;
        }
        let info = DesignInfo {
            n_dpi_funcs,
            max_dpi_args,
            scan_chain_length,
            n_memories,
            shell_version,
            design_hash,
        };
        info!(
            "connected: design {}, {} DPI funcs (max {} args), scan chain {} bits, {} memories, device shell {}.{}",
            info.hash_hex(),
            info.n_dpi_funcs,
            info.max_dpi_args,
            info.scan_chain_length,
            info.n_memories,
            info.shell_version >> 16,
            info.shell_version & 0xFFFF,
        );
        self.info = Some(info);
        Ok(())
    }

    pub fn disconnect(&mut self) -> HostResult<()> {
        self.info = None;
        self.transport.disconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn info(&self) -> HostResult<&DesignInfo> {
        self.info.as_ref().ok_or(HostError::NotConnected)
    }

    pub fn has_irq_support(&self) -> bool {
        self.transport.has_irq_support()
    }

    pub fn wait_irq(&mut self) -> HostResult<u32> {
        self.transport.wait_irq()
    }

    pub fn read32(&mut self, addr: u32) -> HostResult<u32> {
        self.transport.read32(addr)
    }

    pub fn write32(&mut self, addr: u32, value: u32) -> HostResult<()> {
        self.transport.write32(addr, value)
    }

    fn read_pair(&mut self, lo: u32, hi: u32) -> HostResult<u64> {
        let lo = self.read32(lo)?;
        let hi = self.read32(hi)?;
        Ok(u64::from(hi) << 32 | u64::from(lo))
    }

    // --- emulation control ---

    pub fn get_state(&mut self) -> HostResult<EmuState> {
        Ok(EmuState::from_status(self.read32(emu::STATUS)?))
    }

    pub fn start(&mut self) -> HostResult<()> {
        self.write32(emu::COMMAND, emu::CMD_START)
    }

    pub fn stop(&mut self) -> HostResult<()> {
        self.write32(emu::COMMAND, emu::CMD_STOP)
    }

    pub fn reset(&mut self) -> HostResult<()> {
        self.write32(emu::COMMAND, emu::CMD_RESET)
    }

    /// Requests a finish with the given exit code; the peer tears the
    /// session down in response.
    pub fn finish(&mut self, exit_code: i32) -> HostResult<()> {
        self.write32(emu::FINISH, emu::finish_word(exit_code))
    }

    /// Reads the finish register: `Some(exit_code)` once the design (or the
    /// host) requested a finish.
    pub fn finish_code(&mut self) -> HostResult<Option<i32>> {
        let word = self.read32(emu::FINISH)?;
        Ok((word & 1 != 0).then_some((word >> 8 & 0xFF) as i32))
    }

    pub fn get_cycle_count(&mut self) -> HostResult<u64> {
        self.read_pair(emu::CYCLE_LO, emu::CYCLE_HI)
    }

    pub fn get_time(&mut self) -> HostResult<u64> {
        self.read_pair(emu::TIME_LO, emu::TIME_HI)
    }

    pub fn get_time_compare(&mut self) -> HostResult<u64> {
        self.read_pair(emu::TIME_CMP_LO, emu::TIME_CMP_HI)
    }

    pub fn set_time_compare(&mut self, value: u64) -> HostResult<()> {
        self.write32(emu::TIME_CMP_LO, value as u32)?;
        self.write32(emu::TIME_CMP_HI, (value >> 32) as u32)
    }

    /// Stepping is semantic: run until design time advances by `n`.
    pub fn step(&mut self, n: u64) -> HostResult<()> {
        let now = self.get_time()?;
        self.set_time_compare(now.wrapping_add(n))?;
        self.start()
    }

    pub fn couple(&mut self) -> HostResult<()> {
        let ctrl = self.read32(emu::DECOUPLE_CTRL)?;
        self.write32(emu::DECOUPLE_CTRL, ctrl & !1)
    }

    pub fn decouple(&mut self) -> HostResult<()> {
        let ctrl = self.read32(emu::DECOUPLE_CTRL)?;
        self.write32(emu::DECOUPLE_CTRL, ctrl | 1)
    }

    pub fn is_coupled(&mut self) -> HostResult<bool> {
        Ok(self.read32(emu::DECOUPLE_STAT)? & 1 == 0)
    }

    // --- DPI register file ---

    /// One read of the pending-function bitmask.
    pub fn dpi_poll(&mut self) -> HostResult<u32> {
        self.read32(dpi::PENDING)
    }

    /// Captures the argument registers of a pending call.
    pub fn dpi_get_call(&mut self, func_id: u32) -> HostResult<DpiCall> {
        let max_args = self.info()?.max_dpi_args;
        let mut args = SmallVec::new();
        for i in 0..max_args {
            args.push(self.read32(dpi::arg(func_id, i))?);
        }
        Ok(DpiCall { func_id, args })
    }

    /// Writes an argument slot; used to return output-array data.
    pub fn dpi_write_arg(&mut self, func_id: u32, index: u32, value: u32) -> HostResult<()> {
        if index >= self.info()?.max_dpi_args {
            return Err(HostError::InvalidArg(format!(
                "output arg index {index} exceeds the device's argument slots"
            )));
        }
        self.write32(dpi::arg(func_id, index), value)
    }

    /// Publishes the result and releases the design.
    pub fn dpi_complete(&mut self, func_id: u32, result: u64) -> HostResult<()> {
        self.write32(dpi::result_lo(func_id), result as u32)?;
        self.write32(dpi::result_hi(func_id), (result >> 32) as u32)?;
        self.write32(dpi::control(func_id), DpiControl::SET_DONE.bits())
    }

    /// Completes a call as failed without a result.
    pub fn dpi_error(&mut self, func_id: u32) -> HostResult<()> {
        self.write32(dpi::control(func_id), (DpiControl::SET_DONE | DpiControl::SET_ERROR).bits())
    }

    // --- scan chain ---

    fn wait_done(&mut self, done_addr: u32, timeout_ms: u64) -> HostResult<()> {
        let mut waited = 0u64;
        loop {
            if self.read32(done_addr)? & 1 != 0 {
                return Ok(());
            }
            if waited >= timeout_ms {
                return Err(HostError::Timeout(timeout_ms));
            }
            thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            waited += POLL_INTERVAL_MS;
        }
    }

    pub fn scan_capture(&mut self, timeout_ms: u64) -> HostResult<()> {
        self.write32(scan::DONE, 0)?;
        self.write32(scan::COMMAND, scan::CMD_CAPTURE)?;
        self.wait_done(scan::DONE, timeout_ms)
    }

    pub fn scan_restore(&mut self, timeout_ms: u64) -> HostResult<()> {
        self.write32(scan::DONE, 0)?;
        self.write32(scan::COMMAND, scan::CMD_RESTORE)?;
        self.wait_done(scan::DONE, timeout_ms)
    }

    /// Reads the whole scan data window.
    pub fn scan_read_data(&mut self) -> HostResult<Vec<u32>> {
        let n = chain_words(self.info()?.scan_chain_length);
        let mut words = Vec::with_capacity(n);
        for i in 0..n {
            words.push(self.read32(scan::data_word(i as u32))?);
        }
        Ok(words)
    }

    /// Writes the whole scan data window; the slice must cover the chain.
    pub fn scan_write_data(&mut self, words: &[u32]) -> HostResult<()> {
        let n = chain_words(self.info()?.scan_chain_length);
        if words.len() != n {
            return Err(HostError::InvalidArg(format!(
                "scan data is {} words, chain needs {n}",
                words.len()
            )));
        }
        for (i, word) in words.iter().enumerate() {
            self.write32(scan::data_word(i as u32), *word)?;
        }
        Ok(())
    }

    // --- memory shadow ---

    fn mem_select(&mut self, mem_index: u32, entry_addr: u64) -> HostResult<()> {
        self.write32(mem::MEM_SELECT, mem_index)?;
        self.write32(mem::ENTRY_ADDR_LO, entry_addr as u32)?;
        self.write32(mem::ENTRY_ADDR_HI, (entry_addr >> 32) as u32)
    }

    fn mem_command(&mut self, command: u32, timeout_ms: u64) -> HostResult<()> {
        self.write32(mem::DONE, 0)?;
        self.write32(mem::COMMAND, command)?;
        self.wait_done(mem::DONE, timeout_ms)
    }

    pub fn mem_read_entry(
        &mut self,
        mem_index: u32,
        entry_addr: u64,
        entry_words: usize,
        timeout_ms: u64,
    ) -> HostResult<Vec<u32>> {
        self.mem_select(mem_index, entry_addr)?;
        self.mem_command(mem::CMD_READ, timeout_ms)?;
        let mut words = Vec::with_capacity(entry_words);
        for i in 0..entry_words {
            words.push(self.read32(mem::data_word(i as u32))?);
        }
        Ok(words)
    }

    pub fn mem_write_entry(
        &mut self,
        mem_index: u32,
        entry_addr: u64,
        words: &[u32],
        timeout_ms: u64,
    ) -> HostResult<()> {
        for (i, word) in words.iter().enumerate() {
            self.write32(mem::data_word(i as u32), *word)?;
        }
        self.mem_select(mem_index, entry_addr)?;
        self.mem_command(mem::CMD_WRITE, timeout_ms)
    }

    /// Arms streaming preload at entry 0 of the selected memory.
    pub fn mem_preload_start(&mut self, mem_index: u32, timeout_ms: u64) -> HostResult<()> {
        self.mem_select(mem_index, 0)?;
        self.mem_command(mem::CMD_PRELOAD_START, timeout_ms)
    }

    /// Pushes the next entry of a streaming preload.
    pub fn mem_preload_next(&mut self, words: &[u32], timeout_ms: u64) -> HostResult<()> {
        for (i, word) in words.iter().enumerate() {
            self.write32(mem::data_word(i as u32), *word)?;
        }
        self.mem_command(mem::CMD_PRELOAD_NEXT, timeout_ms)
    }
}
