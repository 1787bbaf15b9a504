use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tether_core::config::{NodeConfig, SwitchSection};
use tether_core::events::{StatusObserver, TracingObserver};
use tether_core::mqtt::{AlwaysUp, MqttClient, MqttLogLayer, RumqttSession, ThreadResolver};
use tether_core::node::Component;
use tether_core::ota::{OtaHandler, OtaServer, OtaUploader, RandomNonce};
use tether_core::staging::FileTarget;
use tether_core::switch::{FileOutput, MqttSwitch, Switch, VirtualOutput};
use tether_core::transport::{TcpOtaListener, TcpTransport};
use tether_core::{BootGuard, FilePreferences, Node};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Exit code telling the supervisor to restart the node.
const EXIT_REBOOT: i32 = 3;
const LOG_QUEUE_CAPACITY: usize = 64;

type HostClient = MqttClient<RumqttSession, ThreadResolver, AlwaysUp>;

#[derive(Parser, Debug)]
#[command(author, version, about = "Device network control plane", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node until it asks for a reboot
    Run {
        /// Path to the node configuration
        #[arg(short, long, default_value = "tether.toml")]
        config: PathBuf,
    },
    /// Write a default configuration file
    InitConfig {
        #[arg(default_value = "tether.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Push a firmware image to a device's OTA port
    Upload {
        /// Device host name or address
        host: String,

        /// Firmware image
        image: PathBuf,

        #[arg(short, long, default_value_t = tether_core::protocol::DEFAULT_OTA_PORT)]
        port: u16,

        /// OTA password, if the device requires one
        #[arg(long)]
        password: Option<String>,
    },
}

fn env_filter(verbose: bool) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::builder()
        .with_default_directive(if verbose {
            tracing::Level::DEBUG.into()
        } else {
            tracing::Level::INFO.into()
        })
        .from_env_lossy()
}

fn main() {
    let args = Args::parse();

    let result = match args.command {
        Command::Run { config } => run(&config, args.verbose),
        Command::InitConfig { path, force } => {
            init_logging(args.verbose);
            init_config(&path, force).map(|()| 0)
        }
        Command::Upload {
            host,
            image,
            port,
            password,
        } => {
            init_logging(args.verbose);
            upload(&host, port, &image, password).map(|()| 0)
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_writer(std::io::stderr)
        .init();
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let mut config = NodeConfig::default();
    config.switches.push(SwitchSection {
        id: "relay".to_string(),
        name: "Relay".to_string(),
        output: None,
        inverted: false,
    });
    config
        .save_to_file(path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "Wrote default configuration");
    Ok(())
}

fn upload(host: &str, port: u16, image: &Path, password: Option<String>) -> Result<()> {
    let data = std::fs::read(image).with_context(|| format!("reading {}", image.display()))?;
    let addr: SocketAddr = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {host}"))?
        .next()
        .with_context(|| format!("no address for {host}"))?;

    info!(addr = %addr, size = data.len(), "Connecting to device");
    let mut stream = TcpTransport::connect(addr, Duration::from_secs(10))?;
    let mut uploader = OtaUploader::new(password, Box::new(RandomNonce));

    let mut last_pct = None;
    uploader.upload(&mut stream, &data, |sent, total| {
        let pct = sent * 100 / total.max(1);
        if last_pct != Some(pct / 10) {
            last_pct = Some(pct / 10);
            info!(progress = %format!("{pct}%"), "Uploading");
        }
    })?;
    info!("OTA successful");
    Ok(())
}

fn switch_component(
    prefix: &str,
    section: &SwitchSection,
) -> Box<dyn Component<RumqttSession, ThreadResolver, AlwaysUp>> {
    let name = if section.name.is_empty() {
        &section.id
    } else {
        &section.name
    };
    match &section.output {
        Some(path) => {
            let switch = Switch::new(name, FileOutput::new(path)).inverted(section.inverted);
            Box::new(MqttSwitch::new(prefix, &section.id, switch))
        }
        None => {
            let switch = Switch::new(name, VirtualOutput::new()).inverted(section.inverted);
            Box::new(MqttSwitch::new(prefix, &section.id, switch))
        }
    }
}

fn build_client(config: &NodeConfig, observer: Arc<dyn StatusObserver>) -> Result<HostClient> {
    let mqtt = &config.mqtt;
    let mut client = MqttClient::new(
        mqtt.credentials(),
        config.topic_prefix(),
        RumqttSession::new(),
        ThreadResolver::new(),
        AlwaysUp,
        observer,
    );
    client.set_keep_alive(mqtt.keep_alive());
    client.set_reboot_timeout(mqtt.reboot_timeout());
    client.set_log_level(mqtt.log_level()?);
    if let Some(birth) = &mqtt.birth_message {
        client.set_birth_message(birth.clone());
    }
    if let Some(will) = &mqtt.will_message {
        client.set_last_will(will.clone());
    }
    if let Some(shutdown) = &mqtt.shutdown_message {
        client.set_shutdown_message(shutdown.clone());
    }
    if !mqtt.log_topic_enabled {
        client.disable_log_message();
    }
    if !mqtt.discovery_prefix.is_empty() {
        client.set_discovery_info(mqtt.discovery_prefix.clone(), mqtt.discovery_retain);
    }
    Ok(client)
}

fn run(config_path: &Path, verbose: bool) -> Result<i32> {
    let config = match NodeConfig::load_from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            init_logging(verbose);
            return Err(e).with_context(|| format!("loading {}", config_path.display()));
        }
    };

    let log_level = config.mqtt.log_level()?;
    let (log_layer, log_lines) = MqttLogLayer::new(log_level, LOG_QUEUE_CAPACITY);
    tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(config.mqtt.log_topic_enabled.then_some(log_layer))
        .init();

    info!(device = %config.device.name, "Starting tether node...");
    let observer: Arc<dyn StatusObserver> = Arc::new(TracingObserver);

    let mut client = build_client(&config, observer.clone())?;
    if config.mqtt.log_topic_enabled {
        client.set_log_forwarder(log_lines);
    }

    let listener = TcpOtaListener::bind(config.ota.port)?;
    let target = FileTarget::new(&config.ota.staging_dir, config.ota.max_size);
    let handler = OtaHandler::new(
        config.ota.password.clone(),
        Box::new(RandomNonce),
        observer.clone(),
    );
    let ota = OtaServer::new(listener, target, handler);

    let mut node = Node::new(config.device.name.clone(), client, ota, observer.clone())
        .with_loop_interval(config.loop_interval());
    if config.safe_mode.enabled {
        let prefs = FilePreferences::new(config.preferences_path());
        let guard = BootGuard::new(
            Box::new(prefs),
            config.safe_mode.num_attempts,
            config.safe_mode.enable_time(),
            observer,
        );
        node = node.with_boot_guard(guard, config.safe_mode.window());
    }
    for section in &config.switches {
        node.add_component(switch_component(config.topic_prefix(), section));
    }

    let reason = node.run()?;
    info!(reason = %reason, "Rebooting...");
    Ok(EXIT_REBOOT)
}
