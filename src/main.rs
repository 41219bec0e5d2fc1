//! Joy-Con Command CLI
//!
//! Lists, monitors and drives Joy-Con, Pro Controller and legacy
//! controllers from the terminal.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

use joycon_cmd::config::Config;
use joycon_cmd::device::ConnectionType;
use joycon_cmd::hid::{self, HidBackend};
use joycon_cmd::manager::{match_criteria, ControllerHandle, ControllerManager, ManagerHandle};
use joycon_cmd::protocol::{HighFrequency, LowFrequency, PlayerLights, Rumble, RumbleSide};
use joycon_cmd::{InputEvent, ManagerEvent};

/// Joy-Con controller tool
#[derive(Parser)]
#[command(name = "joycon-cmd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: <config dir>/joycon-cmd/config.json)
    #[arg(short, long, env = "JOYCON_CMD_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected controllers
    List,

    /// Stream controller events until Ctrl+C
    Monitor {
        /// Output one JSON object per event
        #[arg(long)]
        json: bool,
    },

    /// Rumble the first controller that connects
    Rumble {
        /// Amplitude (0-100)
        #[arg(short, long, default_value_t = 50)]
        amplitude: u8,

        /// High band frequency in Hz
        #[arg(long, default_value_t = 320.0)]
        high_hz: f32,

        /// Low band frequency in Hz
        #[arg(long, default_value_t = 160.0)]
        low_hz: f32,

        /// Duration in milliseconds
        #[arg(short, long, default_value_t = 500)]
        duration_ms: u64,
    },

    /// Set the player lights, e.g. "1000", "1100" or "f000"
    Lights {
        pattern: String,
    },

    /// Read bytes from SPI flash
    ReadFlash {
        /// Address, decimal or 0x-prefixed hex
        address: String,

        /// Number of bytes (1-29)
        length: u8,
    },

    /// Generate a configuration file with defaults
    Init {
        /// Output file path (default: the configuration path)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file to validate
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(
                format!("joycon_cmd={}", log_level)
                    .parse()
                    .context("Invalid log directive")?,
            ),
        )
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .or_else(Config::default_path)
        .unwrap_or_else(|| PathBuf::from("./config.json"));

    match cli.command {
        Commands::List => list_controllers(),
        Commands::Monitor { json } => monitor(load_config(&config_path)?, json).await,
        Commands::Rumble {
            amplitude,
            high_hz,
            low_hz,
            duration_ms,
        } => {
            let side = RumbleSide {
                high_freq: HighFrequency::from_hz(high_hz),
                high_amp: amplitude,
                low_freq: LowFrequency::from_hz(low_hz),
                low_amp: amplitude,
            };
            rumble(load_config(&config_path)?, side, Duration::from_millis(duration_ms)).await
        }
        Commands::Lights { pattern } => lights(load_config(&config_path)?, &pattern).await,
        Commands::ReadFlash { address, length } => {
            let address = parse_address(&address)?;
            read_flash(load_config(&config_path)?, address, length).await
        }
        Commands::Init { output } => init_config(output.unwrap_or(config_path)),
        Commands::Validate { file } => validate_config(file),
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load_or_default(path)
        .with_context(|| format!("Failed to load config from {:?}", path))?;
    debug!("Loaded configuration: {}", config.name);
    Ok(config)
}

fn parse_address(text: &str) -> Result<u32> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("Invalid flash address: {}", text))
}

fn list_controllers() -> Result<()> {
    println!("{}", "Searching for controllers...".dimmed());

    let devices = hid::enumerate(&match_criteria()).context("Failed to initialize HID API")?;

    if devices.is_empty() {
        println!("{} No controllers found", "✗".bright_red());
        println!();
        println!("Make sure your controller is:");
        println!("  • Connected via USB cable, or");
        println!(
            "  • Paired via Bluetooth (hold the {} button to pair)",
            "sync".bright_cyan()
        );
        return Ok(());
    }

    println!("\n{} Found {} controller(s):\n", "✓".bright_green(), devices.len());

    for (i, device) in devices.iter().enumerate() {
        let connection = match device.connection_type {
            ConnectionType::Bluetooth => "Bluetooth".bright_magenta(),
            ConnectionType::Usb => "USB".bright_cyan(),
        };
        println!(
            "  {}. {} ({}) [{:04x}:{:04x}] - Serial: {}",
            i + 1,
            device.product_name.bright_white(),
            connection,
            device.vendor_id,
            device.product_id,
            device.serial.dimmed()
        );
    }

    println!();
    Ok(())
}

/// Running manager plus a Ctrl+C hook that stops it
struct Session {
    handle: ManagerHandle,
    events: broadcast::Receiver<ManagerEvent>,
    task: JoinHandle<joycon_cmd::Result<()>>,
}

impl Session {
    fn start(config: &Config) -> Result<Self> {
        let manager = ControllerManager::new(config);
        let events = manager.subscribe();
        let handle = manager.handle();

        let stopper = handle.clone();
        ctrlc::set_handler(move || {
            info!("Received shutdown signal");
            stopper.stop();
        })
        .context("Error setting Ctrl-C handler")?;

        let task = manager.spawn(HidBackend::from_config(&config.manager));
        Ok(Self {
            handle,
            events,
            task,
        })
    }

    /// Wait for the first controller to finish initializing
    async fn first_controller(&mut self, timeout: Duration) -> Result<ControllerHandle> {
        println!("{} Searching for controller...", "→".bright_blue());
        let wait = async {
            loop {
                match self.events.recv().await {
                    Ok(ManagerEvent::Connected(controller)) => return Ok(controller),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(anyhow!("Controller manager stopped"))
                    }
                }
            }
        };
        let controller = tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| anyhow!("No controller connected within {:?}", timeout))??;
        println!(
            "{} Connected to {} ({})",
            "✓".bright_green(),
            controller.variant().to_string().bright_white(),
            controller.serial().dimmed()
        );
        Ok(controller)
    }

    async fn finish(self) -> Result<()> {
        self.handle.stop();
        self.task
            .await
            .context("Controller manager task failed")?
            .context("Controller manager failed")?;
        Ok(())
    }
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

async fn monitor(config: Config, json: bool) -> Result<()> {
    let mut session = Session::start(&config)?;
    println!("{} Monitoring controllers...", "→".bright_blue());
    println!("{}", "Press Ctrl+C to stop".dimmed());
    println!();

    loop {
        let event = match session.events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("Monitor lagged behind by {} events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if json {
            print_event_json(&event).await;
        } else {
            print_event_pretty(&event).await;
        }
    }

    session.finish().await?;
    println!("\n{} Monitoring stopped", "✓".bright_green());
    Ok(())
}

async fn print_event_json(event: &ManagerEvent) {
    let value = match event {
        ManagerEvent::Connected(controller) => match controller.snapshot().await {
            Ok(snapshot) => serde_json::json!({ "type": "connected", "controller": snapshot }),
            Err(_) => return,
        },
        ManagerEvent::Disconnected {
            device,
            variant,
            serial,
        } => serde_json::json!({
            "type": "disconnected",
            "device": device,
            "variant": variant,
            "serial": serial,
        }),
        ManagerEvent::Input { device, event } => serde_json::json!({
            "type": "input",
            "device": device,
            "event": event,
        }),
    };
    println!("{}", value);
}

async fn print_event_pretty(event: &ManagerEvent) {
    match event {
        ManagerEvent::Connected(controller) => {
            println!(
                "{} {} connected ({}, {:?})",
                "✓".bright_green(),
                controller.variant().to_string().bright_white(),
                controller.serial().dimmed(),
                controller.info().connection_type
            );
            if let Ok(snapshot) = controller.snapshot().await {
                if let Some(colors) = snapshot.colors {
                    println!(
                        "  body #{:02x}{:02x}{:02x}  buttons #{:02x}{:02x}{:02x}",
                        colors.body.0,
                        colors.body.1,
                        colors.body.2,
                        colors.buttons.0,
                        colors.buttons.1,
                        colors.buttons.2
                    );
                }
            }
        }
        ManagerEvent::Disconnected { variant, serial, .. } => {
            println!("{} {} ({}) disconnected", "✗".bright_red(), variant, serial.dimmed());
        }
        ManagerEvent::Input { device, event } => {
            let prefix = format!("[{}]", device).dimmed();
            match event {
                InputEvent::ButtonPressed { button } => {
                    println!("{} {:?} {}", prefix, button, "pressed".bright_green())
                }
                InputEvent::ButtonReleased { button } => {
                    println!("{} {:?} {}", prefix, button, "released".yellow())
                }
                InputEvent::StickDirectionChanged {
                    stick, direction, ..
                } => println!("{} {:?} stick -> {:?}", prefix, stick, direction),
                InputEvent::BatteryChanged { level, previous } => {
                    println!("{} battery {:?} -> {:?}", prefix, previous, level)
                }
                InputEvent::ChargingChanged { charging } => println!(
                    "{} {}",
                    prefix,
                    if *charging { "charging" } else { "not charging" }
                ),
                // too frequent for line output
                InputEvent::StickMoved { .. } | InputEvent::Motion { .. } => {}
            }
        }
    }
}

async fn rumble(config: Config, side: RumbleSide, duration: Duration) -> Result<()> {
    let mut session = Session::start(&config)?;
    let controller = session.first_controller(CONNECT_TIMEOUT).await?;

    if !controller.enable_vibration(true).await? {
        println!("{} Vibration enable was not acknowledged", "!".bright_yellow());
    }
    controller.send_rumble(Rumble::both(side)).await?;
    tokio::time::sleep(duration).await;
    controller.send_rumble(Rumble::off()).await?;
    println!("{} Rumble sent", "✓".bright_green());

    session.finish().await
}

async fn lights(config: Config, pattern: &str) -> Result<()> {
    let lights = PlayerLights::from_pattern(pattern)
        .ok_or_else(|| anyhow!("Pattern must be 4 characters of 0, 1 or f: {}", pattern))?;
    let mut session = Session::start(&config)?;
    let controller = session.first_controller(CONNECT_TIMEOUT).await?;

    if controller.set_player_lights(lights).await? {
        println!("{} Player lights set to {}", "✓".bright_green(), pattern);
    } else {
        println!("{} Controller did not acknowledge the lights", "✗".bright_red());
    }

    session.finish().await
}

async fn read_flash(config: Config, address: u32, length: u8) -> Result<()> {
    let mut session = Session::start(&config)?;
    let controller = session.first_controller(CONNECT_TIMEOUT).await?;

    match controller.read_flash(address, length).await? {
        Some(data) => {
            for (i, chunk) in data.chunks(16).enumerate() {
                let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
                println!("{:#06x}: {}", address as usize + i * 16, hex.join(" "));
            }
        }
        None => println!("{} No data returned for {:#06x}", "✗".bright_red(), address),
    }

    session.finish().await
}

fn init_config(output: PathBuf) -> Result<()> {
    if output.exists() {
        bail!("{} already exists", output.display());
    }
    let config = Config::default();
    config
        .save(&output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "{} Created configuration at {}",
        "✓".bright_green(),
        output.display().to_string().bright_white()
    );
    Ok(())
}

fn validate_config(file: PathBuf) -> Result<()> {
    print!("Validating {}... ", file.display());

    match Config::load(&file) {
        Ok(config) => {
            println!("{}", "OK".bright_green());
            println!("\nConfiguration: {}", config.name.bright_yellow());
            println!(
                "  Subcommand timeout: {} ms",
                config.manager.subcommand_timeout_ms
            );
            println!("  Scan interval: {} ms", config.manager.scan_interval_ms);
            match config.on_connect.input_mode {
                Some(mode) => println!("  Input mode on connect: {:?}", mode),
                None => println!("  Input mode on connect: unchanged"),
            }
            println!("  Enable IMU: {}", config.on_connect.enable_imu);
            if let Some(pattern) = &config.on_connect.player_lights {
                println!("  Player lights: {}", pattern.bright_cyan());
            }
            Ok(())
        }
        Err(e) => {
            println!("{}", "FAILED".bright_red());
            println!("\nError: {}", e);
            Err(e)
        }
    }
}
