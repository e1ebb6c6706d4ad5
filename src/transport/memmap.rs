//! Memory-mapped transport to an FPGA register window.
//!
//! Two modes are negotiated from the target string. A sysfs resource (or a
//! raw PCI bus address, which is rewritten to its canonical resource path)
//! is mapped as a window and accessed with volatile loads/stores. Any other
//! device path is opened for positional 4-byte reads/writes; if a sibling
//! event device exists (XDMA naming), `wait_irq` blocks on it reading MSI
//! event counts.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use log::debug;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::error::{HostError, HostResult};
use crate::transport::Transport;

/// How a target string resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetMode {
    /// Map the whole file as a register window.
    Window(PathBuf),
    /// Positional read/write syscalls on the device node.
    Positional(PathBuf),
}

/// Recognizes PCI bus addresses (`dddd:bb:dd.f`) and sysfs resource paths
/// as window targets; everything else is positional.
pub fn resolve_target(target: &str) -> TargetMode {
    if is_pci_address(target) {
        return TargetMode::Window(PathBuf::from(format!(
            "/sys/bus/pci/devices/{target}/resource0"
        )));
    }
    if target.starts_with("/sys/") || target.contains("resource") {
        return TargetMode::Window(PathBuf::from(target));
    }
    TargetMode::Positional(PathBuf::from(target))
}

fn is_pci_address(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 12 {
        return false;
    }
    let hex = |r: std::ops::Range<usize>| bytes[r].iter().all(u8::is_ascii_hexdigit);
    hex(0..4) && bytes[4] == b':' && hex(5..7) && bytes[7] == b':' && hex(8..10)
        && bytes[10] == b'.' && hex(11..12)
}

/// Event-device path for a user register device, per the XDMA naming
/// convention (`xdma0_user` -> `xdma0_events_0`).
pub fn event_path(device: &Path) -> Option<PathBuf> {
    let name = device.file_name()?.to_str()?;
    let stem = name.strip_suffix("_user")?;
    Some(device.with_file_name(format!("{stem}_events_0")))
}

struct Window {
    // Keeps the descriptor alive for the lifetime of the mapping.
    _file: File,
    base: NonNull<c_void>,
    len: usize,
}

impl Window {
    fn map(path: &Path) -> HostResult<Window> {
        let file = OpenOptions::new().read(true).write(true).open(path).map_err(|e| {
            HostError::Transport(format!("open {}: {e}", path.display()))
        })?;
        let len = file
            .metadata()
            .map_err(|e| HostError::Transport(format!("stat {}: {e}", path.display())))?
            .len() as usize;
        let len_nz = NonZeroUsize::new(len).ok_or_else(|| {
            HostError::Transport(format!("{}: zero-sized resource", path.display()))
        })?;
        let base = unsafe {
            mmap(None, len_nz, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, MapFlags::MAP_SHARED, &file, 0)
        }
        .map_err(|e| HostError::Transport(format!("mmap {}: {e}", path.display())))?;
        Ok(Window { _file: file, base, len })
    }

    fn slot(&self, addr: u32) -> HostResult<*mut u32> {
        let addr = addr as usize;
        if addr % 4 != 0 {
            return Err(HostError::InvalidArg(format!("unaligned register address {addr:#x}")));
        }
        if addr + 4 > self.len {
            return Err(HostError::InvalidArg(format!(
                "register address {addr:#x} beyond window of {:#x} bytes",
                self.len
            )));
        }
        Ok(unsafe { self.base.as_ptr().cast::<u32>().add(addr / 4) })
    }

    fn read32(&self, addr: u32) -> HostResult<u32> {
        let slot = self.slot(addr)?;
        Ok(unsafe { std::ptr::read_volatile(slot) })
    }

    fn write32(&self, addr: u32, value: u32) -> HostResult<()> {
        let slot = self.slot(addr)?;
        unsafe { std::ptr::write_volatile(slot, value) };
        Ok(())
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        // SAFETY: base/len came from a successful mmap and are unmapped once.
        unsafe {
            let _ = munmap(self.base, self.len);
        }
    }
}

struct Positional {
    file: File,
    events: Option<File>,
}

impl Positional {
    fn open(path: &Path) -> HostResult<Positional> {
        let file = OpenOptions::new().read(true).write(true).open(path).map_err(|e| {
            HostError::Transport(format!("open {}: {e}", path.display()))
        })?;
        let events = event_path(path).and_then(|ev| match File::open(&ev) {
            Ok(file) => {
                debug!("interrupt events from {}", ev.display());
                Some(file)
            }
            Err(e) => {
                debug!("no event device at {} ({e}); falling back to polling", ev.display());
                None
            }
        });
        Ok(Positional { file, events })
    }

    fn read32(&self, addr: u32) -> HostResult<u32> {
        let mut buf = [0u8; 4];
        self.file
            .read_exact_at(&mut buf, u64::from(addr))
            .map_err(|e| HostError::Transport(format!("pread {addr:#x}: {e}")))?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write32(&self, addr: u32, value: u32) -> HostResult<()> {
        self.file
            .write_all_at(&value.to_le_bytes(), u64::from(addr))
            .map_err(|e| HostError::Transport(format!("pwrite {addr:#x}: {e}")))
    }

    /// Blocks reading one MSI event count. Same EINTR discipline as the
    /// stream transport: interruptible only before the first byte.
    fn wait_event(&self) -> HostResult<u32> {
        let Some(events) = &self.events else { return Err(HostError::NotSupported) };
        let fd = events.as_raw_fd();
        let mut buf = [0u8; 4];
        let mut got = 0usize;
        while got < 4 {
            let n = unsafe { libc::read(fd, buf[got..].as_mut_ptr().cast(), 4 - got) };
            if n == 0 {
                return Err(HostError::Shutdown);
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    if got == 0 {
                        return Err(HostError::Interrupted);
                    }
                    continue;
                }
                return Err(HostError::from_peer_io(err));
            }
            got += n as usize;
        }
        Ok(u32::from_le_bytes(buf))
    }
}

enum Backend {
    Window(Window),
    Positional(Positional),
}

pub struct MemMapTransport {
    target: String,
    backend: Option<Backend>,
}

impl MemMapTransport {
    pub fn new(target: impl Into<String>) -> MemMapTransport {
        MemMapTransport { target: target.into(), backend: None }
    }

    fn backend(&self) -> HostResult<&Backend> {
        self.backend.as_ref().ok_or(HostError::NotConnected)
    }
}

impl Transport for MemMapTransport {
    fn connect(&mut self) -> HostResult<()> {
        let backend = match resolve_target(&self.target) {
            TargetMode::Window(path) => Backend::Window(Window::map(&path)?),
            TargetMode::Positional(path) => Backend::Positional(Positional::open(&path)?),
        };
        self.backend = Some(backend);
        Ok(())
    }

    fn disconnect(&mut self) -> HostResult<()> {
        // Dropping the backend unmaps the window and closes descriptors.
        self.backend = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.backend.is_some()
    }

    fn read32(&mut self, addr: u32) -> HostResult<u32> {
        match self.backend()? {
            Backend::Window(w) => w.read32(addr),
            Backend::Positional(p) => p.read32(addr),
        }
    }

    fn write32(&mut self, addr: u32, value: u32) -> HostResult<()> {
        match self.backend()? {
            Backend::Window(w) => w.write32(addr, value),
            Backend::Positional(p) => p.write32(addr, value),
        }
    }

    /// Returns the MSI event count read from the event device. Callers
    /// treat it as a wake-up and drain the pending mask themselves.
    fn wait_irq(&mut self) -> HostResult<u32> {
        match self.backend()? {
            Backend::Window(_) => Err(HostError::NotSupported),
            Backend::Positional(p) => p.wait_event(),
        }
    }

    fn has_irq_support(&self) -> bool {
        matches!(self.backend, Some(Backend::Positional(ref p)) if p.events.is_some())
    }
}
