//! The interactive shell: a line-oriented REPL (or script driver) that
//! orchestrates runs, steps, snapshots and restores.
//!
//! The non-obvious part is the scan-based boot protocol. The first start
//! out of `Idle`/`Frozen` must (1) invoke the initial-time DPI callbacks
//! that are not bound to scan ranges, (2) invoke each reset-time DPI
//! callback and patch its result into the initial scan image, (3) scan the
//! image into the design. Steps 1 and 2 happen at most once per session;
//! `reset` re-applies only step 3.

use std::fs;
use std::io::{self, BufRead, Write as _};
use std::path::Path;

use log::{error, info, trace, warn};

use crate::context::Context;
use crate::dpi::{DpiService, RunOutcome};
use crate::error::{HostError, HostResult};
use crate::interrupt::{self, SigintGuard};
use crate::memory::{self, MemMap};
use crate::regmap::EmuState;
use crate::scan::{self, ScanMap};
use crate::snapshot::Snapshot;

/// Completion timeout for scan and memory commands.
const OP_TIMEOUT_MS: u64 = 1000;
/// Inactivity window after which a polling-mode run counts as complete.
const RUN_IDLE_TIMEOUT_MS: u64 = 10_000;

/// What a command asks of the surrounding loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit(i32),
}

pub struct Shell<'a> {
    ctx: &'a mut Context,
    svc: &'a mut DpiService,
    scan_map: Option<ScanMap>,
    mem_map: Option<MemMap>,
    initial_image: Option<Vec<u8>>,
    /// Boot-protocol latches; both phases are idempotent per session.
    init_calls_done: bool,
    scan_init_done: bool,
    /// The design requested a finish; further steps are no-ops.
    finished: bool,
}

impl<'a> Shell<'a> {
    pub fn new(ctx: &'a mut Context, svc: &'a mut DpiService) -> Shell<'a> {
        Shell {
            ctx,
            svc,
            scan_map: None,
            mem_map: None,
            initial_image: None,
            init_calls_done: false,
            scan_init_done: false,
            finished: false,
        }
    }

    /// Picks up the artifacts the compile tool left in the work directory.
    pub fn load_work_dir(&mut self, dir: &Path) -> HostResult<()> {
        let scan_map_path = dir.join("scan_map.bin");
        if scan_map_path.exists() {
            let map = ScanMap::load(&scan_map_path)?;
            info!(
                "scan map: {} variables over {} bits, {} reset-DPI mappings",
                map.variables.len(),
                map.chain_length,
                map.reset_dpi.len()
            );
            if let Some(image) = &map.initial_image {
                self.initial_image = Some(image.clone());
            }
            self.scan_map = Some(map);
        }
        let image_path = dir.join("initial_scan.bin");
        if image_path.exists() {
            let image = fs::read(&image_path)
                .map_err(|e| HostError::InvalidArg(format!("{}: {e}", image_path.display())))?;
            info!("initial scan image: {} bytes", image.len());
            self.initial_image = Some(image);
        }
        let mem_map_path = dir.join("mem_map.bin");
        if mem_map_path.exists() {
            let map = MemMap::load(&mem_map_path)?;
            info!("memory map: {} memories", map.memories.len());
            self.mem_map = Some(map);
        }
        Ok(())
    }

    /// Interactive loop. Per-command errors print and return to the
    /// prompt; `Shutdown` ends the session cleanly.
    pub fn repl(&mut self) -> i32 {
        let stdin = io::stdin();
        let mut lines = stdin.lock().lines();
        loop {
            print!("loom> ");
            let _ = io::stdout().flush();
            let Some(line) = lines.next() else { return 0 };
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!("stdin: {e}");
                    return 1;
                }
            };
            match self.exec_line(&line) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit(code)) => return code,
                Err(HostError::Shutdown) => {
                    info!("Shutdown received");
                    return 0;
                }
                Err(e) => eprintln!("error: {e}"),
            }
        }
    }

    /// Script mode: one command per line, `#` comments; the first failing
    /// command aborts.
    pub fn run_script(&mut self, path: &Path) -> i32 {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                error!("{}: {e}", path.display());
                return 1;
            }
        };
        for line in text.lines() {
            match self.exec_line(line) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit(code)) => return code,
                Err(HostError::Shutdown) => {
                    info!("Shutdown received");
                    return 0;
                }
                Err(e) => {
                    error!("script `{}`: {e}", line.trim());
                    return 1;
                }
            }
        }
        0
    }

    /// Executes one command line.
    pub fn exec_line(&mut self, line: &str) -> HostResult<Flow> {
        let line = line.split('#').next().unwrap_or("");
        let mut tokens = line.split_whitespace();
        let Some(command) = tokens.next() else { return Ok(Flow::Continue) };
        let args: Vec<&str> = tokens.collect();
        match command {
            "run" | "r" => self.cmd_run()?,
            "stop" => self.ctx.stop()?,
            "step" | "s" => {
                let n = match args.first() {
                    Some(raw) => parse_u64(raw)?,
                    None => 1,
                };
                self.cmd_step(n)?;
            }
            "status" | "st" => self.cmd_status()?,
            "reset" => self.cmd_reset()?,
            "dump" | "d" => self.cmd_dump(args.first().copied())?,
            "inspect" => self.cmd_inspect(required(&args, 0, "inspect <snapshot>")?)?,
            "deposit_script" => {
                let snapshot = required(&args, 0, "deposit_script <snapshot> [out]")?;
                self.cmd_deposit_script(snapshot, args.get(1).copied())?;
            }
            "read" => {
                let addr = parse_u32(required(&args, 0, "read <addr>")?)?;
                let value = self.ctx.read32(addr)?;
                println!("[{addr:#07x}] = {value:#010x}");
            }
            "write" => {
                let addr = parse_u32(required(&args, 0, "write <addr> <value>")?)?;
                let value = parse_u32(required(&args, 1, "write <addr> <value>")?)?;
                self.ctx.write32(addr, value)?;
            }
            "loadmem" => {
                let mem = required(&args, 0, "loadmem <memory> <file>")?;
                let file = required(&args, 1, "loadmem <memory> <file>")?;
                self.cmd_loadmem(mem, file)?;
            }
            "couple" => {
                self.ctx.couple()?;
                info!("design coupled to the register bus");
            }
            "decouple" => {
                self.ctx.decouple()?;
                info!("design decoupled from the register bus");
            }
            "help" | "h" | "?" => print_help(),
            "exit" | "quit" | "q" => return Ok(Flow::Exit(0)),
            other => eprintln!("unknown command `{other}`; try `help`"),
        }
        Ok(Flow::Continue)
    }

    // --- run / step ---

    fn cmd_run(&mut self) -> HostResult<()> {
        self.prepare_start()?;
        self.ctx.start()?;
        self.run_loop()
    }

    fn cmd_step(&mut self, n: u64) -> HostResult<()> {
        if self.finished {
            // Stepping past a finish is a no-op; just report where we are.
            info!("design finished at cycle {}", self.ctx.get_cycle_count()?);
            return Ok(());
        }
        self.prepare_start()?;
        self.ctx.step(n)?;
        self.run_loop()
    }

    /// Scan-based boot protocol, steps 1-3. Safe to call before every
    /// start; the latches keep it from repeating.
    fn prepare_start(&mut self) -> HostResult<()> {
        let state = self.ctx.get_state()?;
        if !matches!(state, EmuState::Idle | EmuState::Frozen) {
            return Ok(());
        }
        if !self.init_calls_done {
            self.execute_init_calls();
            self.init_calls_done = true;
        }
        if !self.scan_init_done {
            self.apply_scan_image()?;
            self.scan_init_done = true;
        }
        Ok(())
    }

    /// Steps 1 and 2: initial-time callbacks, then reset-time patches.
    fn execute_init_calls(&mut self) {
        for func in self.svc.funcs() {
            if !func.call_at_init {
                continue;
            }
            if self.scan_map.as_ref().is_some_and(|m| m.is_reset_dpi(func.func_id)) {
                // Reset-bound functions run in the patch pass below.
                continue;
            }
            trace!("initial-time DPI call: {}", func.name);
            let mut out = vec![0u32; func.out_arg_words as usize];
            let _ = func.callback.invoke(&[], &mut out);
        }
        let Some(map) = &self.scan_map else { return };
        if map.reset_dpi.is_empty() {
            return;
        }
        let Some(image) = self.initial_image.as_mut() else {
            warn!("scan map declares reset-DPI mappings but no initial image is loaded");
            return;
        };
        for mapping in &map.reset_dpi {
            let Some(func) = self.svc.find_func_by_id(mapping.func_id) else {
                warn!("reset-DPI mapping names unknown function {}", mapping.func_id);
                continue;
            };
            let mut out = vec![0u32; func.out_arg_words as usize];
            let result = func.callback.invoke(&[], &mut out);
            trace!(
                "reset-time DPI call {} -> {result:#x} patched at bits [{}, {})",
                func.name,
                mapping.scan_offset,
                mapping.scan_offset + mapping.scan_width
            );
            scan::patch_bits(image, mapping.scan_offset, mapping.scan_width, result);
        }
    }

    /// Step 3: scan the (patched) initial image into the design.
    fn apply_scan_image(&mut self) -> HostResult<()> {
        let Some(image) = &self.initial_image else { return Ok(()) };
        let chain_length = self.ctx.info()?.scan_chain_length;
        let words = scan::image_to_words(image, chain_length);
        self.ctx.scan_write_data(&words)?;
        self.ctx.scan_restore(OP_TIMEOUT_MS)?;
        info!("initial state scanned in ({} bits)", chain_length);
        Ok(())
    }

    fn cmd_reset(&mut self) -> HostResult<()> {
        self.ctx.reset()?;
        // Scan-reset the design: re-apply the image, but never the
        // init-time or reset-time callbacks.
        self.apply_scan_image()?;
        self.finished = false;
        Ok(())
    }

    /// Drives the design with SIGINT honored: the handler raises a flag,
    /// the service loop returns, and we stop the design.
    fn run_loop(&mut self) -> HostResult<()> {
        let _guard = SigintGuard::install()?;
        match self.svc.run(self.ctx, RUN_IDLE_TIMEOUT_MS)? {
            RunOutcome::Interrupted => {
                self.ctx.stop()?;
                interrupt::clear();
                info!("Interrupted at cycle {}", self.ctx.get_cycle_count()?);
            }
            RunOutcome::Complete => {
                if let Some(code) = self.ctx.finish_code()? {
                    self.finished = true;
                    info!(
                        "design finished with exit code {code} at cycle {}",
                        self.ctx.get_cycle_count()?
                    );
                } else {
                    info!("stopped at cycle {}", self.ctx.get_cycle_count()?);
                }
            }
            RunOutcome::EmuError => error!("design entered the error state"),
            RunOutcome::Shutdown => return Err(HostError::Shutdown),
        }
        Ok(())
    }

    // --- inspection ---

    fn cmd_status(&mut self) -> HostResult<()> {
        let state = self.ctx.get_state()?;
        let cycle = self.ctx.get_cycle_count()?;
        let time = self.ctx.get_time()?;
        println!(
            "state {state:?}  cycle {cycle}  time {time}  dpi calls {} ({} errors)",
            self.svc.calls_serviced(),
            self.svc.errors()
        );
        Ok(())
    }

    /// Captures the scan chain, prints the variables, and optionally writes
    /// a self-contained snapshot.
    fn cmd_dump(&mut self, file: Option<&str>) -> HostResult<()> {
        if self.ctx.get_state()? == EmuState::Running {
            self.ctx.stop()?;
        }
        self.ctx.scan_capture(OP_TIMEOUT_MS)?;
        let words = self.ctx.scan_read_data()?;
        match &self.scan_map {
            Some(map) => print_variables(map, &words),
            None => println!("no scan map loaded; captured {} raw words", words.len()),
        }
        if let Some(path) = file {
            let info = self.ctx.info()?;
            let chain_length = info.scan_chain_length;
            let design_hash = info.design_hash;
            let snapshot = Snapshot {
                cycle_count: self.ctx.get_cycle_count()?,
                dut_time: self.ctx.get_time()?,
                design_hash,
                raw_scan_data: scan::words_to_image(&words, chain_length),
                scan_map: self.scan_map.clone(),
            };
            snapshot.save(Path::new(path))?;
            println!("snapshot written to {path}");
        }
        Ok(())
    }

    fn cmd_inspect(&mut self, path: &str) -> HostResult<()> {
        let snapshot = Snapshot::load(Path::new(path))?;
        let Some(map) = &snapshot.scan_map else {
            return Err(HostError::InvalidArg(format!("{path}: snapshot has no embedded scan map")));
        };
        println!(
            "cycle {}  time {}  design {}",
            snapshot.cycle_count,
            snapshot.dut_time,
            hash_hex(&snapshot.design_hash)
        );
        let words = scan::image_to_words(&snapshot.raw_scan_data, map.chain_length);
        print_variables(map, &words);
        Ok(())
    }

    /// Re-emits a snapshot as `deposit` statements for an external
    /// simulator shell.
    fn cmd_deposit_script(&mut self, path: &str, out: Option<&str>) -> HostResult<()> {
        let snapshot = Snapshot::load(Path::new(path))?;
        let Some(map) = &snapshot.scan_map else {
            return Err(HostError::InvalidArg(format!("{path}: snapshot has no embedded scan map")));
        };
        let words = scan::image_to_words(&snapshot.raw_scan_data, map.chain_length);
        let mut script = String::new();
        for var in &map.variables {
            let value = scan::extract_bits(&words, var.offset, var.width);
            script.push_str(&format!("deposit {} {}'h{value:x}\n", var.hdl_path, var.width));
        }
        match out {
            Some(out_path) => fs::write(out_path, script)
                .map_err(|e| HostError::InvalidArg(format!("{out_path}: {e}")))?,
            None => print!("{script}"),
        }
        Ok(())
    }

    fn cmd_loadmem(&mut self, mem_spec: &str, file: &str) -> HostResult<()> {
        let Some(map) = &self.mem_map else {
            return Err(HostError::InvalidArg("no memory map loaded".into()));
        };
        let Some(desc) = map.find(mem_spec) else {
            return Err(HostError::InvalidArg(format!("unknown memory `{mem_spec}`")));
        };
        let (index, entry_words, depth, name) =
            (desc.index, desc.entry_words(), desc.depth, desc.name.clone());
        let words = memory::load_word_file(Path::new(file))?;
        if words.len() % entry_words != 0 {
            return Err(HostError::InvalidArg(format!(
                "{file}: {} words is not a whole number of {entry_words}-word entries",
                words.len()
            )));
        }
        let n_entries = (words.len() / entry_words) as u64;
        if n_entries > depth {
            return Err(HostError::InvalidArg(format!(
                "{file}: {n_entries} entries exceed the depth {depth} of `{name}`"
            )));
        }
        self.ctx.mem_preload_start(index, OP_TIMEOUT_MS)?;
        for entry in words.chunks(entry_words) {
            self.ctx.mem_preload_next(entry, OP_TIMEOUT_MS)?;
        }
        info!("preloaded {n_entries} entries into `{name}`");
        Ok(())
    }
}

fn print_variables(map: &ScanMap, words: &[u32]) {
    for var in &map.variables {
        let value = scan::extract_bits(words, var.offset, var.width);
        match var.member_name(value) {
            Some(member) => println!("  {} = {member} ({value:#x})", var.name),
            None => println!("  {} = {value:#x}", var.name),
        }
    }
}

fn hash_hex(hash: &[u32; 8]) -> String {
    hash.iter().rev().map(|w| format!("{w:08x}")).collect()
}

fn required<'t>(args: &[&'t str], index: usize, usage: &str) -> HostResult<&'t str> {
    args.get(index).copied().ok_or_else(|| HostError::InvalidArg(format!("usage: {usage}")))
}

fn parse_u64(raw: &str) -> HostResult<u64> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|_| HostError::InvalidArg(format!("`{raw}` is not a number")))
}

fn parse_u32(raw: &str) -> HostResult<u32> {
    let value = parse_u64(raw)?;
    u32::try_from(value)
        .map_err(|_| HostError::InvalidArg(format!("`{raw}` does not fit in 32 bits")))
}

fn print_help() {
    println!(
        "\
commands:
  run (r)                       start and service DPI calls until the design freezes
  step (s) [N]                  advance design time by N (default 1)
  stop                          stop the design clocks
  reset                         reset and re-apply the initial scan state
  status (st)                   one-line state summary
  dump (d) [FILE]               capture the scan chain; optionally write a snapshot
  inspect FILE                  print the variables of a snapshot file
  deposit_script FILE [OUT]     emit deposit statements from a snapshot
  read ADDR                     raw register read
  write ADDR VALUE              raw register write
  loadmem MEMORY FILE           preload a memory from a word file
  couple / decouple             toggle the bus firewall
  help (h, ?)                   this text
  exit (quit, q)                leave the shell"
    );
}
