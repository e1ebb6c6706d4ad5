//! A deterministic in-process peer speaking the wire protocol, backed by a
//! small register model of the on-device emulation controller. Tests
//! script it through `PeerConfig` and assert on the access log it returns.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::thread::JoinHandle;

use loom_host::dpi::{DpiCallback, DpiFunc, HostCallback};
use loom_host::regmap::{self, dpi, emu, mem, scan};
use loom_host::wire::{Frame, FrameKind, FRAME_LEN};

pub const STATE_IDLE: u32 = 0;
pub const STATE_RUNNING: u32 = 1;
pub const STATE_FROZEN: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read(u32),
    Write(u32, u32),
}

#[derive(Clone)]
pub struct PeerConfig {
    pub n_dpi_funcs: u32,
    /// 0 makes the host fall back to its default of 8.
    pub max_dpi_args: u32,
    pub scan_chain_length: u32,
    pub n_memories: u32,
    pub shell_version: u32,
    pub design_hash: [u32; 8],
    /// Calls raised together when the design starts.
    pub calls: Vec<(u32, Vec<u32>)>,
    /// Backing values for raw reads the model does not cover.
    pub regs: HashMap<u32, u32>,
    /// One-shot: interleave an Irq frame before the next read response.
    pub irq_before_read_resp: Option<u32>,
    /// Send a shutdown frame instead of starting.
    pub shutdown_on_start: bool,
    /// Stay in Running and raise nothing (interrupt tests).
    pub stay_running: bool,
    /// Never complete scan commands (timeout tests).
    pub scan_never_done: bool,
    /// Latch a design finish with this exit code when the run completes.
    pub finish_code: Option<u32>,
}

impl Default for PeerConfig {
    fn default() -> PeerConfig {
        PeerConfig {
            n_dpi_funcs: 8,
            max_dpi_args: 0,
            scan_chain_length: 64,
            n_memories: 0,
            shell_version: regmap::SHELL_VERSION,
            design_hash: [0x11111111; 8],
            calls: Vec::new(),
            regs: HashMap::new(),
            irq_before_read_resp: None,
            shutdown_on_start: false,
            stay_running: false,
            scan_never_done: false,
            finish_code: None,
        }
    }
}

pub struct PeerState {
    cfg: PeerConfig,
    /// Every register access, in wire order.
    pub log: Vec<Access>,
    pub state: u32,
    pub pending: u32,
    /// (func_id, slot) -> value; covers raised args and written-back outputs.
    pub args: HashMap<(u32, u32), u32>,
    result_lo: HashMap<u32, u32>,
    result_hi: HashMap<u32, u32>,
    /// func_id -> composed result, recorded at SetDone.
    pub results: HashMap<u32, u64>,
    /// func_ids completed with SetError, in order.
    pub error_completions: Vec<u32>,
    pub time: u64,
    pub time_cmp: u64,
    pub cycle: u64,
    pub finish_reg: u32,
    /// The design's captured/restored state image.
    pub scan_store: Vec<u32>,
    /// The scan data window.
    pub scan_buf: Vec<u32>,
    pub scan_done: u32,
    pub mem_done: u32,
    pub mem_select: u32,
    pub mem_entry_addr: u64,
    mem_buf: Vec<u32>,
    mem_high_water: usize,
    /// Entries streamed in via preload.
    pub preloaded: Vec<Vec<u32>>,
    pub decouple: u32,
    out_irq: Vec<u32>,
    shutdown_after_ack: bool,
    remaining_calls: Vec<(u32, Vec<u32>)>,
    irq_injection: Option<u32>,
}

impl PeerState {
    fn new(cfg: PeerConfig) -> PeerState {
        let chain_words = (cfg.scan_chain_length as usize + 31) / 32;
        PeerState {
            remaining_calls: cfg.calls.clone(),
            irq_injection: cfg.irq_before_read_resp,
            scan_store: vec![0; chain_words],
            scan_buf: vec![0; chain_words],
            log: Vec::new(),
            state: STATE_IDLE,
            pending: 0,
            args: HashMap::new(),
            result_lo: HashMap::new(),
            result_hi: HashMap::new(),
            results: HashMap::new(),
            error_completions: Vec::new(),
            time: 0,
            time_cmp: 0,
            cycle: 0,
            finish_reg: 0,
            scan_done: 0,
            mem_done: 0,
            mem_select: 0,
            mem_entry_addr: 0,
            mem_buf: vec![0; 64],
            mem_high_water: 0,
            preloaded: Vec::new(),
            decouple: 0,
            out_irq: Vec::new(),
            shutdown_after_ack: false,
            cfg,
        }
    }

    fn read_reg(&mut self, addr: u32) -> u32 {
        if addr == emu::STATUS {
            self.state
        } else if addr == emu::N_DPI_FUNCS {
            self.cfg.n_dpi_funcs
        } else if addr == emu::MAX_DPI_ARGS {
            self.cfg.max_dpi_args
        } else if addr == emu::SCAN_CHAIN_LENGTH {
            self.cfg.scan_chain_length
        } else if addr == emu::N_MEMORIES {
            self.cfg.n_memories
        } else if addr == emu::SHELL_VERSION {
            self.cfg.shell_version
        } else if addr == emu::CYCLE_LO {
            self.cycle as u32
        } else if addr == emu::CYCLE_HI {
            (self.cycle >> 32) as u32
        } else if addr == emu::TIME_LO {
            self.time as u32
        } else if addr == emu::TIME_HI {
            (self.time >> 32) as u32
        } else if addr == emu::TIME_CMP_LO {
            self.time_cmp as u32
        } else if addr == emu::TIME_CMP_HI {
            (self.time_cmp >> 32) as u32
        } else if addr == emu::FINISH {
            self.finish_reg
        } else if addr == emu::DECOUPLE_CTRL || addr == emu::DECOUPLE_STAT {
            self.decouple
        } else if (emu::DESIGN_HASH..emu::DESIGN_HASH + 32).contains(&addr) {
            self.cfg.design_hash[((addr - emu::DESIGN_HASH) / 4) as usize]
        } else if addr == dpi::PENDING {
            self.pending
        } else if (regmap::DPI_REGFILE_BASE..regmap::SCAN_CTRL_BASE).contains(&addr) {
            let offset = addr - regmap::DPI_REGFILE_BASE;
            let (func_id, within) = (offset / 64, offset % 64);
            if (0x08..0x38).contains(&within) {
                self.args.get(&(func_id, (within - 0x08) / 4)).copied().unwrap_or(0)
            } else {
                0
            }
        } else if addr == scan::DONE {
            self.scan_done
        } else if addr >= scan::DATA && addr < regmap::MEM_CTRL_BASE {
            let index = ((addr - scan::DATA) / 4) as usize;
            self.scan_buf.get(index).copied().unwrap_or(0)
        } else if addr == mem::DONE {
            self.mem_done
        } else if addr >= mem::DATA {
            let index = ((addr - mem::DATA) / 4) as usize;
            self.mem_buf.get(index).copied().unwrap_or(0)
        } else {
            self.cfg.regs.get(&addr).copied().unwrap_or(0)
        }
    }

    fn write_reg(&mut self, addr: u32, value: u32) {
        if addr == emu::COMMAND {
            match value {
                emu::CMD_START => self.on_start(),
                emu::CMD_STOP => self.state = STATE_IDLE,
                emu::CMD_RESET => {
                    self.cycle = 0;
                    self.time = 0;
                }
                _ => {}
            }
        } else if addr == emu::TIME_CMP_LO {
            self.time_cmp = (self.time_cmp & !0xFFFF_FFFF) | u64::from(value);
        } else if addr == emu::TIME_CMP_HI {
            self.time_cmp = (self.time_cmp & 0xFFFF_FFFF) | (u64::from(value) << 32);
        } else if addr == emu::FINISH {
            self.finish_reg = value;
        } else if addr == emu::DECOUPLE_CTRL {
            self.decouple = value;
        } else if (regmap::DPI_REGFILE_BASE..regmap::SCAN_CTRL_BASE).contains(&addr)
            && addr != dpi::PENDING
        {
            let offset = addr - regmap::DPI_REGFILE_BASE;
            let (func_id, within) = (offset / 64, offset % 64);
            match within {
                0x04 => self.on_dpi_control(func_id, value),
                0x38 => {
                    self.result_lo.insert(func_id, value);
                }
                0x3C => {
                    self.result_hi.insert(func_id, value);
                }
                w if (0x08..0x38).contains(&w) => {
                    self.args.insert((func_id, (w - 0x08) / 4), value);
                }
                _ => {}
            }
        } else if addr == scan::DONE {
            self.scan_done = value & 1;
        } else if addr == scan::COMMAND {
            if !self.cfg.scan_never_done {
                match value {
                    scan::CMD_CAPTURE => {
                        self.scan_buf = self.scan_store.clone();
                        self.scan_done = 1;
                    }
                    scan::CMD_RESTORE => {
                        self.scan_store = self.scan_buf.clone();
                        self.scan_done = 1;
                    }
                    _ => {}
                }
            }
        } else if addr >= scan::DATA && addr < regmap::MEM_CTRL_BASE {
            let index = ((addr - scan::DATA) / 4) as usize;
            if index >= self.scan_buf.len() {
                self.scan_buf.resize(index + 1, 0);
            }
            self.scan_buf[index] = value;
        } else if addr == mem::DONE {
            self.mem_done = value & 1;
        } else if addr == mem::MEM_SELECT {
            self.mem_select = value;
        } else if addr == mem::ENTRY_ADDR_LO {
            self.mem_entry_addr = (self.mem_entry_addr & !0xFFFF_FFFF) | u64::from(value);
        } else if addr == mem::ENTRY_ADDR_HI {
            self.mem_entry_addr = (self.mem_entry_addr & 0xFFFF_FFFF) | (u64::from(value) << 32);
        } else if addr == mem::COMMAND {
            match value {
                mem::CMD_PRELOAD_START => {
                    self.preloaded.clear();
                    self.mem_high_water = 0;
                    self.mem_done = 1;
                }
                mem::CMD_PRELOAD_NEXT => {
                    let entry = self.mem_buf[..=self.mem_high_water].to_vec();
                    self.preloaded.push(entry);
                    self.mem_high_water = 0;
                    self.mem_done = 1;
                }
                mem::CMD_READ | mem::CMD_WRITE => self.mem_done = 1,
                _ => {}
            }
        } else if addr >= mem::DATA {
            let index = ((addr - mem::DATA) / 4) as usize;
            if index >= self.mem_buf.len() {
                self.mem_buf.resize(index + 1, 0);
            }
            self.mem_buf[index] = value;
            self.mem_high_water = self.mem_high_water.max(index);
        }
    }

    fn on_start(&mut self) {
        if self.cfg.shutdown_on_start {
            self.shutdown_after_ack = true;
            return;
        }
        self.state = STATE_RUNNING;
        if !self.remaining_calls.is_empty() {
            let mut mask = 0u32;
            for (func_id, call_args) in std::mem::take(&mut self.remaining_calls) {
                mask |= 1 << func_id;
                for (slot, value) in call_args.iter().enumerate() {
                    self.args.insert((func_id, slot as u32), *value);
                }
            }
            self.pending = mask;
            self.out_irq.push(mask);
        } else if !self.cfg.stay_running {
            self.complete_run();
            self.out_irq.push(0);
        }
    }

    fn on_dpi_control(&mut self, func_id: u32, value: u32) {
        if value & 1 == 0 {
            return;
        }
        self.pending &= !(1 << func_id);
        if value & 2 != 0 {
            self.error_completions.push(func_id);
        } else {
            let lo = self.result_lo.get(&func_id).copied().unwrap_or(0);
            let hi = self.result_hi.get(&func_id).copied().unwrap_or(0);
            self.results.insert(func_id, u64::from(hi) << 32 | u64::from(lo));
        }
        if self.pending == 0 && self.state == STATE_RUNNING && !self.cfg.stay_running {
            self.complete_run();
            self.out_irq.push(0);
        }
    }

    /// The design reached its time compare: freeze and latch any scripted
    /// finish.
    fn complete_run(&mut self) {
        self.time = self.time.max(self.time_cmp);
        self.cycle += 10;
        self.state = STATE_FROZEN;
        if let Some(code) = self.cfg.finish_code {
            self.finish_reg = 1 | (code & 0xFF) << 8;
        }
    }
}

pub struct Peer {
    pub endpoint: PathBuf,
    handle: JoinHandle<PeerState>,
    _dir: tempfile::TempDir,
}

impl Peer {
    /// Waits for the host to disconnect and returns the final model state.
    pub fn join(self) -> PeerState {
        self.handle.join().expect("peer thread panicked")
    }
}

pub fn spawn(cfg: PeerConfig) -> Peer {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = dir.path().join("sim.sock");
    let listener = UnixListener::bind(&endpoint).unwrap();
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        serve(stream, cfg)
    });
    Peer { endpoint, handle, _dir: dir }
}

fn serve(mut stream: UnixStream, cfg: PeerConfig) -> PeerState {
    let mut st = PeerState::new(cfg);
    loop {
        let mut raw = [0u8; FRAME_LEN];
        if stream.read_exact(&mut raw).is_err() {
            break; // host disconnected
        }
        let frame = Frame::decode(&raw).expect("host sent a malformed frame");
        match frame.kind {
            FrameKind::Read => {
                st.log.push(Access::Read(frame.addr));
                let value = st.read_reg(frame.addr);
                if let Some(mask) = st.irq_injection.take() {
                    stream.write_all(&Frame::irq(mask).encode()).unwrap();
                }
                let response = Frame { kind: FrameKind::Read, addr: value, data: 0 };
                stream.write_all(&response.encode()).unwrap();
            }
            FrameKind::Write => {
                st.log.push(Access::Write(frame.addr, frame.data));
                st.write_reg(frame.addr, frame.data);
                let ack = Frame { kind: FrameKind::Write, addr: 0, data: 0 };
                stream.write_all(&ack.encode()).unwrap();
                for mask in std::mem::take(&mut st.out_irq) {
                    stream.write_all(&Frame::irq(mask).encode()).unwrap();
                }
                if st.shutdown_after_ack {
                    stream.write_all(&Frame::shutdown().encode()).unwrap();
                    break;
                }
            }
            other => panic!("host sent a peer-only frame {other:?}"),
        }
    }
    st
}

/// A host-side dispatch entry for tests.
pub fn host_func(func_id: u32, name: &str, n_args: u32, callback: HostCallback) -> DpiFunc {
    DpiFunc {
        func_id,
        name: name.to_string(),
        n_args,
        ret_width: 64,
        call_at_init: false,
        out_arg_words: 0,
        callback: DpiCallback::Host(callback),
    }
}

/// A dense table of `n` do-nothing functions.
pub fn filler_funcs(n: u32) -> Vec<DpiFunc> {
    fn nop(_args: &[u32], _out: &mut [u32]) -> u64 {
        0
    }
    (0..n).map(|id| host_func(id, &format!("nop{id}"), 0, nop)).collect()
}

/// The accesses that touched the DPI register file.
pub fn dpi_accesses(log: &[Access]) -> Vec<Access> {
    log.iter()
        .copied()
        .filter(|access| {
            let addr = match access {
                Access::Read(addr) | Access::Write(addr, _) => *addr,
            };
            (regmap::DPI_REGFILE_BASE..regmap::SCAN_CTRL_BASE).contains(&addr)
        })
        .collect()
}
