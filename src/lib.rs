//! Host-side runtime for the loom hardware emulation platform.
//!
//! An instrumented design runs either inside a simulator reachable over a
//! local stream socket or on an FPGA reachable through a memory-mapped
//! register window. This crate drives it at register level: start, stop,
//! step, snapshot and reset, and above all service the foreign function
//! calls the design raises back into the host process. While such a call is
//! pending the design's clocks are frozen; the host reads the argument
//! registers, dispatches to a user-supplied native routine, writes the
//! result back and releases the design.

mod codec;
pub mod context;
pub mod dpi;
pub mod error;
pub mod interrupt;
pub mod loader;
pub mod manifest;
pub mod memory;
pub mod regmap;
pub mod scan;
pub mod shell;
pub mod snapshot;
pub mod transport;
pub mod wire;

pub use context::{Context, DesignInfo, DpiCall};
pub use dpi::{DpiCallback, DpiFunc, DpiService, RunOutcome};
pub use error::{HostError, HostResult};
pub use manifest::Manifest;
pub use memory::MemMap;
pub use regmap::EmuState;
pub use scan::ScanMap;
pub use shell::Shell;
pub use snapshot::Snapshot;
pub use transport::{MemMapTransport, StreamTransport, Transport};
