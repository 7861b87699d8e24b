//! Signal wiring for the daemon.
//!
//! SIGINT, SIGTERM and SIGHUP cancel the shutdown token (through `ctrlc`);
//! SIGUSR1 asks the main loop for an immediate statistics dump.

use std::sync::atomic::{AtomicBool, Ordering};

use rngfeed_core::ShutdownToken;

static DUMP_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Install handlers. Must run after daemonizing: `ctrlc` starts a thread,
/// and threads do not survive `fork`.
pub fn install(shutdown: &ShutdownToken) -> Result<(), ctrlc::Error> {
    let token = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown requested");
        token.cancel();
    })?;
    // SAFETY: signal() registers a C-linkage handler for SIGUSR1.
    // on_sigusr1 is a valid extern "C" fn and only touches an atomic.
    unsafe {
        libc::signal(libc::SIGUSR1, on_sigusr1 as *const () as libc::sighandler_t);
    }
    Ok(())
}

/// The flag the main loop polls; set by SIGUSR1.
pub fn dump_request() -> &'static AtomicBool {
    &DUMP_REQUESTED
}

extern "C" fn on_sigusr1(_: libc::c_int) {
    DUMP_REQUESTED.store(true, Ordering::SeqCst);
}
