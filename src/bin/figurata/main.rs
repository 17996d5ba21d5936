//! Service entry point: detect the peripherals, load the catalog, print a
//! status slip, and hand control to the state machine.

use clap::Parser;
use figurata::{
    args::FigurataArgs,
    catalog::Catalog,
    config::Settings,
    content::{ContentClient, FallbackTable},
    display::Display,
    printer::{Printer, PrinterError, Style},
    rate_limit::RateLimiter,
    rfid::RfidReader,
    service::Service,
    store::SlipStore,
};
use log::{error, info, warn};
use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
};

/// Exit code when a required device cannot be claimed at startup.
const EXIT_DEVICE: u8 = 2;
/// Exit code for configuration trouble (catalog, region, output dir).
const EXIT_CONFIG: u8 = 3;

static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_signal(_signal: libc::c_int) {
    if let Some(flag) = SHUTDOWN.get() {
        flag.store(true, Ordering::Release);
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = FigurataArgs::parse();
    info!("=== figurata service starting ===");

    let settings = match Settings::load(&args) {
        Ok(settings) => settings,
        Err(e) => {
            error!("configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if !settings.print_enabled {
        info!("*** NO-PRINT MODE: printing disabled to save paper ***");
    }

    let catalog = match Catalog::load(&settings.catalog_path) {
        Ok(catalog) => catalog,
        Err(e) => {
            error!("catalog load failed: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    info!("catalog: {} registered tags", catalog.registered_tags());

    let fallback = match FallbackTable::load(&settings.fallback_path) {
        Ok(table) => {
            info!("fallback table: {} row(s)", table.len());
            table
        }
        Err(e) => {
            warn!("fallback table unavailable ({}), shipped defaults only", e);
            FallbackTable::default()
        }
    };

    info!("detecting devices...");
    let reader = match RfidReader::auto_detect(settings.region, settings.tx_power) {
        Ok(reader) => {
            info!("rfid reader: CONNECTED ({})", reader.path().display());
            reader
        }
        Err(e) => {
            error!("rfid reader: MISSING ({})", e);
            return ExitCode::from(EXIT_DEVICE);
        }
    };

    let display = Display::auto_detect(&[reader.path()]);
    let display_ok = display.is_some();
    if display_ok {
        info!("display: CONNECTED");
    } else {
        warn!("display: MISSING (continuing without it)");
    }

    let mut printer = if settings.print_enabled {
        match Printer::open(&settings.printer_device) {
            Ok(printer) => {
                info!("printer: CONNECTED ({})", settings.printer_device.display());
                Some(printer)
            }
            Err(e) => {
                error!("printer: MISSING ({})", e);
                return ExitCode::from(EXIT_DEVICE);
            }
        }
    } else {
        None
    };

    if let Some(printer) = printer.as_mut() {
        match print_status_slip(printer, display_ok, &settings.content_model) {
            Ok(()) => info!("status slip printed"),
            Err(e) => warn!("status slip failed: {}", e),
        }
    }

    let store = match SlipStore::new(
        &settings.output_dir,
        settings.record_store_url.clone(),
        settings.record_store_key.clone(),
    ) {
        Ok(store) => store,
        Err(e) => {
            error!("output directory unusable: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let limiter = RateLimiter::new(
        &settings.rate_limit_file,
        settings.rpm_limit,
        settings.daily_limit,
        settings.rate_limit_max_wait,
    );
    let content = ContentClient::new(
        settings.content_api_url.clone(),
        settings.content_api_key.clone(),
        settings.content_model.clone(),
        limiter,
        fallback,
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = SHUTDOWN.set(shutdown.clone());
    unsafe {
        libc::signal(libc::SIGINT, on_signal as usize);
        libc::signal(libc::SIGTERM, on_signal as usize);
    }

    let mut service = Service::new(
        settings,
        catalog,
        display,
        printer,
        Some(reader),
        content,
        store,
        shutdown,
    );
    service.run();

    info!("=== figurata service stopped ===");
    ExitCode::SUCCESS
}

fn print_status_slip(
    printer: &mut Printer,
    display_ok: bool,
    model: &str,
) -> Result<(), PrinterError> {
    printer.text("--------------------------------", Style::centered());
    printer.text("FIGURATA SERVICE", Style::label());
    printer.text("--------------------------------", Style::centered());
    printer.text(
        &format!("Started: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S")),
        Style::default(),
    );
    printer.text("RFID reader: CONNECTED", Style::default());
    printer.text(
        if display_ok {
            "Display:     CONNECTED"
        } else {
            "Display:     MISSING"
        },
        Style::default(),
    );
    printer.text("Printer:     CONNECTED", Style::default());
    printer.text(&format!("Model:       {}", model), Style::default());
    printer.cut()
}
