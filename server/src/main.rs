use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

use wyd_server::config::ServerConfig;
use wyd_server::server::{Server, TICK_MS};

fn setup_signal_handling(
    quit_flag: Arc<AtomicBool>,
) -> (std::thread::JoinHandle<()>, signal_hook::iterator::Handle) {
    // Set up signal handling in a separate thread
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT, SIGHUP]).unwrap();
    let handle = signals.handle();

    let signal_thread = std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGINT | SIGTERM | SIGQUIT => {
                    if !quit_flag.load(Ordering::SeqCst) {
                        log::info!("Got signal to terminate. Shutdown initiated...");
                    } else {
                        log::info!("Alright, alright, I'm already terminating!");
                    }
                    quit_flag.store(true, Ordering::SeqCst);
                }
                _ => {
                    log::warn!("Received unsupported signal: {}", sig);
                }
            }
        }
    });

    (signal_thread, handle)
}

fn main() -> Result<(), String> {
    wyd_core::initialize_logger(log::LevelFilter::Info, Some("wyd-server.log")).unwrap_or_else(
        |e| {
            eprintln!("Failed to initialize logger: {}. Exiting.", e);
            process::exit(1);
        },
    );

    log::info!("Starting WYD server runtime core v0.1.0");
    log::info!("Process PID: {}", process::id());

    let quit_flag = Arc::new(AtomicBool::new(false));
    let quit_flag_clone = quit_flag.clone();
    let (signal_thread, handle) = setup_signal_handling(quit_flag_clone);

    let config = ServerConfig::from_env();
    let server = Server::new(config);

    if let Err(e) = server.load_data() {
        log::error!("Failed to load game data: {e:#}. Exiting.");
        process::exit(1);
    }

    log::info!("Entering main game loop...");

    while !quit_flag.load(Ordering::SeqCst) {
        server.tick();
        std::thread::sleep(Duration::from_millis(TICK_MS));
    }

    log::info!("Shutdown signal received, exiting main loop...");
    server.shutdown();

    handle.close();
    signal_thread.join().unwrap_or_else(|e| {
        log::error!("Failed to join signal handling thread: {:?}", e);
    });

    Ok(())
}
