use ble_environmental_sensor::accessory::{Accessory, SystemClock};
use ble_environmental_sensor::app::{AccessoryHandle, Options, RunError, run_with_io};
use ble_environmental_sensor::scanner::{self, EVENT_CHANNEL_BUFFER_SIZE};
use clap::Parser;
use log::{LevelFilter, error, info};
use std::panic::{self, PanicHookInfo};
use tokio::sync::mpsc;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Main application entry point.
///
/// This function:
/// 1. Validates the sensor configuration
/// 2. Opens the Bluetooth backend, which reports the adapter state
/// 3. Builds the accessory and logs the services it exposes
/// 4. Handles adapter events and writes characteristic updates to stdout
///    until the backend stops or the process is interrupted
///
/// # Errors
/// Returns `RunError` on invalid configuration or if Bluetooth initialization fails
async fn run(options: Options) -> Result<(), RunError> {
    let settings = options.sensor.validate()?;

    let (tx, events) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
    let central = scanner::open(options.backend, tx).await?;
    info!("Using {} backend", options.backend);

    let accessory = Accessory::from_settings(&settings, central, SystemClock);
    for service in accessory.services() {
        info!("Exposing {} service \"{}\"", service.kind, service.name);
    }

    // No bridge is attached to the binary; updates go to stdout.
    let (_handle, requests) = AccessoryHandle::channel();
    let mut stdout = std::io::stdout();

    tokio::select! {
        result = run_with_io(accessory, events, requests, &mut stdout) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, exiting.");
            Ok(())
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();

    let level = if options.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    match run(options).await {
        Ok(_) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!("{}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
