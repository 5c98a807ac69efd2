use clap::Parser;
use diaper_monitor::{
    logging, BleTransport, ClientConfig, ConsoleSink, EventSink, JsonLinesSink, Result,
    SensorError, Session, SessionSummary, DEVICE_NAME,
};
use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Diagnostic client for the DiaperSensorESP32 moisture sensor
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Advertised name of the sensor
    #[arg(long, default_value = DEVICE_NAME)]
    name: String,

    /// Scan duration in seconds
    #[arg(long, default_value_t = 10.0)]
    scan_timeout: f64,

    /// File that every decoded message is appended to
    #[arg(long, default_value = logging::DEFAULT_LOG_FILE)]
    log_file: PathBuf,

    /// Do not write the handshake token after subscribing
    #[arg(long)]
    no_handshake: bool,

    /// Print events as JSON lines instead of formatted text
    #[arg(long)]
    json: bool,

    /// Show debug logging on the console
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn client_config(&self) -> Result<ClientConfig> {
        let scan_timeout = Duration::try_from_secs_f64(self.scan_timeout).map_err(|e| {
            SensorError::InvalidConfig(format!("invalid scan timeout {}: {e}", self.scan_timeout))
        })?;

        let defaults = ClientConfig::default();
        let config = ClientConfig {
            device_name: self.name.clone(),
            scan_timeout,
            handshake: if self.no_handshake {
                None
            } else {
                defaults.handshake.clone()
            },
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _log_guard = match logging::init(&args.log_file, args.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(&args).await {
        Ok(summary) => {
            print_summary(&summary, args.json);
            ExitCode::SUCCESS
        }
        Err(e) if e.is_cancelled() => {
            info!("Run interrupted: {e}");
            eprintln!("{e}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Run failed: {e}");
            report_failure(&e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<SessionSummary> {
    let config = args.client_config()?;

    if !args.json {
        println!("=== BLE Test Client - Diaper Sensor ===\n");
        println!("Searching for device '{}'...", config.device_name);
    }
    info!("Starting search for device: {}", config.device_name);

    let sink: Arc<dyn EventSink> = if args.json {
        Arc::new(JsonLinesSink::stdout())
    } else {
        Arc::new(ConsoleSink::stdout())
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt signal received");
            interrupt.cancel();
        }
    });

    let transport = Arc::new(BleTransport::new().await?);
    Session::new(transport, config, sink).run(&cancel).await
}

fn print_summary(summary: &SessionSummary, json: bool) {
    let text = format!(
        "📊 Session statistics:\n   Device: {}\n   Messages received: {}\n   Ended: {}",
        summary.device, summary.stats.message_count, summary.end
    );
    if json {
        eprintln!("{text}");
    } else {
        println!("\n{text}");
        println!("\nThanks for using the BLE test client!");
    }
}

fn report_failure(error: &SensorError) {
    eprintln!("✗ {error}");

    if let Some(candidates) = error.candidates() {
        if !candidates.is_empty() {
            eprintln!("Available BLE devices:");
            for (name, address) in candidates {
                eprintln!("  - {name} ({address})");
            }
        }
        eprintln!("\nTip: make sure that:");
        eprintln!("1. The ESP32 is powered on and running the sensor firmware");
        eprintln!("2. Bluetooth is enabled on this machine");
        eprintln!("3. The sensor is not connected to another device");
    } else if error.is_recoverable() {
        eprintln!("You can retry the run once the sensor is in range.");
    }
}
