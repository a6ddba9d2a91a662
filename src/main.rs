use camino::Utf8Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use webserv::EventLoop;

/// Shared with the signal handler, which may only flip the flag; the event
/// loop samples it once per iteration.
static STOP_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_sigint(_signal: libc::c_int) {
    if let Some(flag) = STOP_FLAG.get() {
        flag.store(false, Ordering::Relaxed);
    }
}

fn install_sigint(flag: Arc<AtomicBool>) {
    let _ = STOP_FLAG.set(flag);
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
    }
}

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "webserv".to_string());
    let Some(config_path) = args.next() else {
        log::error!("missing argument! usage: {program} <config-file>");
        return ExitCode::FAILURE;
    };

    log::info!("starting webserv");

    let servers = match webserv::load(Utf8Path::new(&config_path)) {
        Ok(servers) => servers,
        Err(e) => {
            log::error!(error:err = e; "could not load configuration");
            return ExitCode::FAILURE;
        }
    };
    log::info!(count = servers.len(); "loaded servers");

    let running = Arc::new(AtomicBool::new(true));
    install_sigint(running.clone());

    let mut event_loop = match EventLoop::new(servers, running) {
        Ok(event_loop) => event_loop,
        Err(e) => {
            log::error!(error:err = e; "startup failed");
            return ExitCode::FAILURE;
        }
    };

    log::info!("ready to receive requests");
    event_loop.run();

    log::info!("webserv stopped");
    ExitCode::SUCCESS
}
