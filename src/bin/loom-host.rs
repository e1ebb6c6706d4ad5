//! The `loom-host` driver: resolves the work directory the compile tool
//! produced, loads the native images, brings up the transport (spawning the
//! simulator child if needed), verifies the manifest and hands control to
//! the shell.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use log::{info, warn};

use loom_host::loader;
use loom_host::shell::Shell;
use loom_host::transport::{MemMapTransport, StreamTransport, Transport};
use loom_host::{interrupt, Context, DpiService, Manifest};

const DEFAULT_SIM: &str = "loom-sim";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportKind {
    Socket,
    Xdma,
}

struct Args {
    work: PathBuf,
    sv_lib: Option<String>,
    sim: String,
    script: Option<PathBuf>,
    endpoint: Option<PathBuf>,
    transport: TransportKind,
    device: Option<String>,
    timeout_ns: Option<u64>,
    no_sim: bool,
    verbose: bool,
}

const USAGE: &str = "\
usage: loom-host -work DIR [options]
  -work DIR      work directory produced by the compile tool (required)
  -sv_lib NAME   user DPI image (NAME.so, libNAME.so, or absolute path)
  -sim BINARY    simulator executable (default: loom-sim)
  -f SCRIPT      run commands from SCRIPT and exit
  -s ENDPOINT    socket endpoint path (default: /tmp/loom_<pid>.sock)
  -t TRANSPORT   socket | xdma (default: socket)
  -d DEVICE      device path or PCI bus address for -t xdma
  -timeout NS    simulation timeout, passed to the simulator child
  --no-sim       attach to an existing endpoint instead of spawning
  -v             verbose logging
  -h             this text";

/// Parses the flag surface by hand; returns `None` when help was printed.
fn parse_args(argv: Vec<String>) -> Result<Option<Args>> {
    let mut work = None;
    let mut sv_lib = None;
    let mut sim = DEFAULT_SIM.to_string();
    let mut script = None;
    let mut endpoint = None;
    let mut transport = TransportKind::Socket;
    let mut device = None;
    let mut timeout_ns = None;
    let mut no_sim = false;
    let mut verbose = false;

    let mut iter = argv.into_iter();
    while let Some(flag) = iter.next() {
        let mut value = |name: &str| {
            iter.next().with_context(|| format!("flag {name} needs a value"))
        };
        match flag.as_str() {
            "-work" => work = Some(PathBuf::from(value("-work")?)),
            "-sv_lib" => sv_lib = Some(value("-sv_lib")?),
            "-sim" => sim = value("-sim")?,
            "-f" => script = Some(PathBuf::from(value("-f")?)),
            "-s" => endpoint = Some(PathBuf::from(value("-s")?)),
            "-t" => {
                transport = match value("-t")?.as_str() {
                    "socket" => TransportKind::Socket,
                    "xdma" => TransportKind::Xdma,
                    other => bail!("unknown transport `{other}` (socket or xdma)"),
                }
            }
            "-d" => device = Some(value("-d")?),
            "-timeout" => {
                let raw = value("-timeout")?;
                timeout_ns = Some(raw.parse().with_context(|| format!("-timeout {raw}"))?);
            }
            "--no-sim" => no_sim = true,
            "-v" => verbose = true,
            "-h" | "--help" => {
                println!("{USAGE}");
                return Ok(None);
            }
            other => bail!("unknown flag `{other}` (see -h)"),
        }
    }
    let work = work.context("-work DIR is required (see -h)")?;
    Ok(Some(Args {
        work,
        sv_lib,
        sim,
        script,
        endpoint,
        transport,
        device,
        timeout_ns,
        no_sim,
        verbose,
    }))
}

fn main() {
    let args = match parse_args(env::args().skip(1).collect()) {
        Ok(Some(args)) => args,
        Ok(None) => return,
        Err(e) => {
            eprintln!("loom-host: {e:#}");
            process::exit(2);
        }
    };
    let env = env_logger::Env::new()
        .filter_or("LOOM_LOG", if args.verbose { "debug" } else { "info" })
        .write_style("LOOM_LOG_STYLE");
    env_logger::Builder::from_env(env).init();

    let code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            1
        }
    };
    // A child killed by SIGPIPE at teardown is a normal shutdown race.
    process::exit(if code == 141 { 0 } else { code });
}

fn run(args: Args) -> Result<i32> {
    if !args.work.is_dir() {
        bail!("work directory {} does not exist", args.work.display());
    }
    // The peer closing first is normal, not a death sentence.
    interrupt::ignore_sigpipe();

    // Native images before anything touches the design: the dispatch table
    // must be in place for reset-time DPI during the first start.
    let (images, table) = loader::load_images(&args.work, args.sv_lib.as_deref())?;

    let endpoint = args
        .endpoint
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("/tmp/loom_{}.sock", process::id())));
    let mut child = None;
    let mut owns_endpoint = false;
    let transport: Box<dyn Transport> = match args.transport {
        TransportKind::Socket => {
            if !args.no_sim {
                child = Some(loader::spawn_sim(&args.sim, &endpoint, args.timeout_ns, &args.work)?);
                owns_endpoint = true;
                if !loader::wait_for_endpoint(&endpoint, Duration::from_secs(10)) {
                    bail!("endpoint {} did not appear within 10s", endpoint.display());
                }
            }
            Box::new(StreamTransport::new(&endpoint))
        }
        TransportKind::Xdma => {
            let device = args.device.as_deref().context("-t xdma requires -d DEVICE")?;
            Box::new(MemMapTransport::new(device))
        }
    };

    let mut ctx = Context::new(transport);
    ctx.connect().context("connecting to the design")?;

    match Manifest::load(&args.work.join("manifest.cfg")) {
        Ok(manifest) => manifest.verify(ctx.info()?),
        Err(e) => warn!("manifest not verified: {e}"),
    }

    let mut svc = DpiService::new();
    svc.register_funcs(table);

    let code = {
        let mut shell = Shell::new(&mut ctx, &mut svc);
        shell.load_work_dir(&args.work)?;
        match &args.script {
            Some(script) => shell.run_script(script),
            None => shell.repl(),
        }
    };
    info!("serviced {} DPI calls ({} errors)", svc.calls_serviced(), svc.errors());

    teardown(&mut ctx, child, owns_endpoint.then_some(&endpoint), code);
    // Image handles go last so no in-flight frame references unloaded code.
    drop(images);
    Ok(code)
}

/// Unified teardown for design-initiated, host-initiated and peer-loss
/// termination. Every step is best-effort.
fn teardown(
    ctx: &mut Context,
    child: Option<process::Child>,
    endpoint: Option<&PathBuf>,
    code: i32,
) {
    if ctx.is_connected() {
        // Triggers the peer's shutdown; give its trace buffers a beat.
        if let Err(e) = ctx.finish(code) {
            warn!("finish request failed: {e}");
        }
        thread::sleep(Duration::from_millis(100));
        let _ = ctx.disconnect();
    }
    if let Some(mut child) = child {
        match child.wait() {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("simulator exited with {status}"),
            Err(e) => warn!("reaping simulator: {e}"),
        }
    }
    if let Some(endpoint) = endpoint {
        let _ = fs::remove_file(endpoint);
    }
}
