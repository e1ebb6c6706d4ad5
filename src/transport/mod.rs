//! Register-level transports to the design.
//!
//! A transport provides 32-bit register access plus a blocking interrupt
//! wait. Two variants exist: a framed local stream socket to a simulator
//! process, and a memory-mapped (or positional) device window to an FPGA.
//! Contexts own exactly one transport; dispatch is dynamic.

pub mod memmap;
pub mod stream;

pub use memmap::MemMapTransport;
pub use stream::StreamTransport;

use crate::error::HostResult;

pub trait Transport {
    fn connect(&mut self) -> HostResult<()>;

    /// Closes the connection and releases descriptors. Idempotent.
    fn disconnect(&mut self) -> HostResult<()>;

    fn is_connected(&self) -> bool;

    fn read32(&mut self, addr: u32) -> HostResult<u32>;

    fn write32(&mut self, addr: u32, value: u32) -> HostResult<()>;

    /// Blocks until the peer raises an interrupt and returns the accumulated
    /// bitmask. Returns `Interrupted` when a signal arrives at a message
    /// boundary, `Shutdown` when the peer is gone, and `NotSupported` when
    /// the transport has no interrupt path (callers fall back to polling).
    fn wait_irq(&mut self) -> HostResult<u32>;

    fn has_irq_support(&self) -> bool;
}
