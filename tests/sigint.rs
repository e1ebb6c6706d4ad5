//! SIGINT handling. Lives in its own test binary because the interrupt
//! flag and the signal disposition are process-wide; the two scenarios run
//! sequentially inside one test for the same reason.

mod common;

use std::thread;
use std::time::Duration;

use common::{filler_funcs, Access, PeerConfig};
use loom_host::regmap::emu;
use loom_host::shell::{Flow, Shell};
use loom_host::{interrupt, Context, DpiService, RunOutcome, StreamTransport};

fn connected_context(peer: &common::Peer) -> Context {
    let mut ctx = Context::new(Box::new(StreamTransport::new(&peer.endpoint)));
    ctx.connect().unwrap();
    ctx
}

fn stop_writes(log: &[Access]) -> usize {
    log.iter()
        .filter(|a| matches!(a, Access::Write(addr, value)
            if *addr == emu::COMMAND && *value == emu::CMD_STOP))
        .count()
}

#[test]
fn sigint_interrupts_a_running_design() {
    // Scenario 1: a pre-raised flag stops the service loop before it ever
    // blocks.
    {
        let peer = common::spawn(PeerConfig { stay_running: true, ..PeerConfig::default() });
        let mut ctx = connected_context(&peer);
        let mut svc = DpiService::new();
        svc.register_funcs(filler_funcs(1));

        ctx.start().unwrap();
        interrupt::trigger();
        assert_eq!(svc.run(&mut ctx, 1000).unwrap(), RunOutcome::Interrupted);
        interrupt::clear();
        ctx.disconnect().unwrap();
        peer.join();
    }

    // Scenario 2: a real SIGINT delivered mid-`wait_irq`. The handler is
    // installed by the shell's run loop; EINTR surfaces at the frame
    // boundary, the loop sees the flag, and the shell stops the design.
    {
        let peer = common::spawn(PeerConfig { stay_running: true, ..PeerConfig::default() });
        let mut ctx = connected_context(&peer);
        let mut svc = DpiService::new();
        svc.register_funcs(filler_funcs(1));

        let blocked_thread = unsafe { libc::pthread_self() };
        let killer = thread::spawn(move || {
            // Give the run loop time to install the handler and block.
            thread::sleep(Duration::from_millis(300));
            unsafe { libc::pthread_kill(blocked_thread, libc::SIGINT) };
        });

        {
            let mut shell = Shell::new(&mut ctx, &mut svc);
            assert_eq!(shell.exec_line("run").unwrap(), Flow::Continue);
        }
        killer.join().unwrap();
        assert!(!interrupt::is_pending(), "the run loop consumed the flag");

        ctx.disconnect().unwrap();
        let st = peer.join();
        assert_eq!(stop_writes(&st.log), 1);
    }
}
