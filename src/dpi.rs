//! The DPI dispatch core.
//!
//! The design raises foreign calls by setting bits in the pending mask;
//! clocks stay frozen inside the design until the host completes the call,
//! so the host can never be overrun. The dispatch table is produced by an
//! external code generator and loaded from a shared object at startup;
//! entries are dense over `[0, n_funcs)`.

use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::context::Context;
use crate::error::{HostError, HostResult};
use crate::interrupt;
use crate::regmap::EmuState;

/// A host-side callback (built-in tables and tests).
pub type HostCallback = fn(args: &[u32], out: &mut [u32]) -> u64;

/// The two callback flavours. Native callbacks come from the dlopened
/// dispatch image and receive raw pointers; the argument and output slices
/// are always exactly `n_args` and `out_arg_words` long.
#[derive(Clone, Copy)]
pub enum DpiCallback {
    Native(unsafe extern "C" fn(args: *const u32, out: *mut u32) -> u64),
    Host(HostCallback),
}

impl DpiCallback {
    pub fn invoke(&self, args: &[u32], out: &mut [u32]) -> u64 {
        match self {
            DpiCallback::Host(f) => f(args, out),
            // SAFETY: the generated wrapper reads exactly the argument count
            // and writes exactly the output-word count it was declared with.
            DpiCallback::Native(f) => unsafe { f(args.as_ptr(), out.as_mut_ptr()) },
        }
    }
}

pub struct DpiFunc {
    /// Dense over `[0, n_funcs)` and equal to the peer-visible function id.
    pub func_id: u32,
    pub name: String,
    pub n_args: u32,
    /// Result width in bits; informational, results always travel as u64.
    pub ret_width: u32,
    /// Invoke once at initial time, before the scan image goes in.
    pub call_at_init: bool,
    /// Output-array words written back through the argument slots.
    pub out_arg_words: u32,
    pub callback: DpiCallback,
}

/// Outcome of a service loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The design froze (breakpoint, time-compare hit, or finish).
    Complete,
    /// The peer ended the session.
    Shutdown,
    /// The design entered its error state.
    EmuError,
    /// The SIGINT flag was raised; the caller decides what stops.
    Interrupted,
}

#[derive(Default)]
pub struct DpiService {
    funcs: Vec<DpiFunc>,
    calls_serviced: u64,
    errors: u64,
}

impl DpiService {
    pub fn new() -> DpiService {
        DpiService::default()
    }

    /// Installs the dispatch table. Called once after dlopen completes.
    pub fn register_funcs(&mut self, funcs: Vec<DpiFunc>) {
        for (i, func) in funcs.iter().enumerate() {
            debug_assert_eq!(func.func_id, i as u32, "dispatch table must be dense");
            trace!(
                "dpi func {}: {} ({} args, {} out words{})",
                func.func_id,
                func.name,
                func.n_args,
                func.out_arg_words,
                if func.call_at_init { ", init" } else { "" }
            );
        }
        self.funcs = funcs;
    }

    pub fn funcs(&self) -> &[DpiFunc] {
        &self.funcs
    }

    pub fn find_func_by_id(&self, func_id: u32) -> Option<&DpiFunc> {
        self.funcs.get(func_id as usize)
    }

    pub fn calls_serviced(&self) -> u64 {
        self.calls_serviced
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Services every currently-pending call, in ascending function-id
    /// order, and returns how many were dispatched. Non-blocking: returns 0
    /// when the pending mask is clear.
    pub fn service_once(&mut self, ctx: &mut Context) -> HostResult<u32> {
        let mask = ctx.dpi_poll()?;
        if mask == 0 {
            return Ok(0);
        }
        let mut serviced = 0u32;
        for func_id in 0..u32::BITS {
            if mask & (1 << func_id) == 0 {
                continue;
            }
            let (callback, n_args, out_words) = match self.funcs.get(func_id as usize) {
                Some(func) =>
                    (func.callback, func.n_args as usize, func.out_arg_words as usize),
                None => {
                    warn!("design raised DPI call for unknown function {func_id}");
                    ctx.dpi_error(func_id)?;
                    self.errors += 1;
                    continue;
                }
            };
            let call = ctx.dpi_get_call(func_id)?;
            let n_args = n_args.min(call.args.len());
            let mut out = vec![0u32; out_words];
            let result = callback.invoke(&call.args[..n_args], &mut out);
            for (i, word) in out.iter().enumerate() {
                ctx.dpi_write_arg(func_id, i as u32, *word)?;
            }
            // The pending bit stays set until this lands, so nothing raced
            // with the argument reads above.
            ctx.dpi_complete(func_id, result)?;
            self.calls_serviced += 1;
            serviced += 1;
        }
        Ok(serviced)
    }

    /// Drives the design until it freezes, errors, shuts down, or the
    /// SIGINT flag is raised. Interrupt-capable transports block in
    /// `wait_irq`; the rest poll at 1 ms. In polling mode, sustained
    /// inactivity after at least one serviced call also counts as
    /// completion, which keeps scripted test runs bounded.
    pub fn run(&mut self, ctx: &mut Context, timeout_ms: u64) -> HostResult<RunOutcome> {
        let irq_mode = ctx.has_irq_support();
        let mut idle_passes = 0u64;
        loop {
            if interrupt::is_pending() {
                return Ok(RunOutcome::Interrupted);
            }
            if irq_mode {
                match ctx.wait_irq() {
                    Ok(_) => {}
                    Err(HostError::Shutdown) => return Ok(RunOutcome::Shutdown),
                    // The flag check above decides whether this exits.
                    Err(HostError::Interrupted) => continue,
                    Err(err) => return Err(err),
                }
            } else {
                thread::sleep(Duration::from_millis(1));
            }
            let mut drained = 0u32;
            loop {
                match self.service_once(ctx) {
                    Ok(0) => break,
                    Ok(n) => drained += n,
                    Err(HostError::Shutdown) => return Ok(RunOutcome::Shutdown),
                    Err(err) => return Err(err),
                }
            }
            match ctx.get_state() {
                Ok(EmuState::Frozen) => return Ok(RunOutcome::Complete),
                Ok(EmuState::Error) => return Ok(RunOutcome::EmuError),
                Ok(_) => {}
                Err(HostError::Shutdown) => return Ok(RunOutcome::Shutdown),
                Err(err) => return Err(err),
            }
            if !irq_mode {
                if drained == 0 {
                    idle_passes += 1;
                } else {
                    idle_passes = 0;
                }
                if self.calls_serviced > 0 && idle_passes >= timeout_ms / 10 {
                    debug!("no DPI activity for {idle_passes} passes; treating as complete");
                    return Ok(RunOutcome::Complete);
                }
            }
        }
    }
}
