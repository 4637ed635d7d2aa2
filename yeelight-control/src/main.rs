use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use serde_json::Value;
use tokio::sync::oneshot;

use yeelight_control_lib::connection::{
    BasicConnection, Command, Connection, ConnectionConfig, FadeEffect, Reply, ReplyKind,
    DEFAULT_PORT,
};
use yeelight_control_lib::device::cron::CronType;
use yeelight_control_lib::device::props::Prop;
use yeelight_control_lib::device::{Device, DeviceSnapshot};
use yeelight_control_lib::util::discovery::{Scanner, ScannerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    handle_cli(cli).await
}

/// This struct defines the command line interface of the application
#[derive(Parser)]
#[clap(
    name = "yeelight_control",
    about = "Controls Yeelight smart lights on the local network",
    version = "0.1.0"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

/// Supported output formats for the `discover` command.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    /// Plain text format.
    Plaintext,
    /// JSON format.
    Json,
    /// YAML format.
    Yaml,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OnOff {
    On,
    Off,
}

/// Subcommands available for the CLI
#[derive(Subcommand)]
pub enum Commands {
    /// Subcommand for operations that require device communication
    #[clap(name = "device-call")]
    DeviceCall {
        /// Sets the IP address of the light
        #[clap(long)]
        ip: String,

        /// Sets the TCP port of the light
        #[clap(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Device id, only used in log messages
        #[clap(long, default_value_t = 0)]
        id: u64,

        /// How long to wait for the connection and for the reply, in milliseconds
        #[clap(short = 't', long = "timeout", default_value_t = 5000)]
        timeout: u64,

        #[clap(subcommand)]
        action: DeviceAction,
    },
    /// Searches the network for lights
    #[clap(name = "discover")]
    Discover {
        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,

        /// Search timeout in milliseconds
        #[clap(short = 't', long = "timeout", default_value_t = 2000)]
        timeout: u64,
    },
    /// Prints light announcements until interrupted
    #[clap(name = "listen")]
    Listen,
}

/// Actions available under the `device-call` subcommand
#[derive(Subcommand)]
pub enum DeviceAction {
    /// Reads properties, e.g. `get-props power bright`.
    #[clap(name = "get-props")]
    GetProps {
        #[clap(required = true)]
        names: Vec<String>,
    },
    /// Turns the light on or off.
    #[clap(name = "set-power")]
    SetPower {
        #[clap(value_enum)]
        state: OnOff,

        /// Fade duration in milliseconds, 0 for an instant change
        #[clap(long, default_value_t = 500)]
        duration: u32,
    },
    /// Toggles the light.
    #[clap(name = "toggle")]
    Toggle,
    /// Sets the brightness in percent.
    #[clap(name = "set-bright")]
    SetBright {
        #[clap(value_parser = clap::value_parser!(u8).range(1..=100))]
        brightness: u8,

        /// Fade duration in milliseconds, 0 for an instant change
        #[clap(long, default_value_t = 500)]
        duration: u32,
    },
    /// Shows the power-off timer.
    #[clap(name = "get-cron")]
    GetCron,
    /// Sends any method, e.g. `raw set_rgb '[16711680, "smooth", 500]'`.
    #[clap(name = "raw")]
    Raw {
        method: String,

        /// Parameters as a JSON array
        #[clap(default_value = "[]")]
        params: String,
    },
}

async fn handle_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Discover { output, timeout } => {
            let scanner = Scanner::new(ScannerConfig::default());
            let result = scanner.scan_for(Duration::from_millis(timeout)).await;
            if let Some(e) = result.error {
                return Err(e.context("Discovery failed"));
            }
            if result.devices.is_empty() {
                eprintln!("No lights answered. If lights are missing, try increasing the search timeout.");
            }
            match output {
                OutputFormat::Plaintext => {
                    Scanner::pretty_print_devices(&result.devices);
                }
                OutputFormat::Json => {
                    let json = serde_json::to_string(&snapshots(&result.devices))?;
                    println!("{}", json);
                }
                OutputFormat::Yaml => {
                    let yaml = serde_yaml::to_string(&snapshots(&result.devices))?;
                    println!("{}", yaml);
                }
            }
        }
        Commands::Listen => {
            let scanner = Arc::new(Scanner::new(ScannerConfig::default()));
            let listening = scanner.clone();
            let listener = tokio::spawn(async move {
                listening
                    .listen(|device| {
                        let power = if device.props().get_bool(Prop::Power) {
                            "on"
                        } else {
                            "off"
                        };
                        println!("{} power={}", device, power);
                    })
                    .await
            });
            tokio::signal::ctrl_c().await?;
            info!("Interrupted, stopping");
            scanner.stop();
            listener.await??;
        }
        Commands::DeviceCall {
            ip,
            port,
            id,
            timeout,
            action,
        } => {
            let timeout = Duration::from_millis(timeout);
            let device = Arc::new(Device::new(id, "", &ip, port));
            let connection = Arc::new(BasicConnection::for_device(
                &device,
                ConnectionConfig {
                    connect_timeout: timeout,
                    ..ConnectionConfig::default()
                },
            ));
            device.set_connection(connection.clone())?;
            connection
                .connect_sync()
                .await
                .with_context(|| format!("Failed to connect to {}:{}", ip, port))?;

            let command = build_command(&device, connection.as_ref(), action)?;
            let reply = send_and_wait(&device, command, timeout).await;
            connection.try_disconnect();
            print_reply(&reply?);
        }
    }

    Ok(())
}

fn snapshots(devices: &std::collections::HashMap<u64, Arc<Device>>) -> BTreeMap<u64, DeviceSnapshot> {
    devices
        .iter()
        .map(|(id, device)| (*id, device.snapshot()))
        .collect()
}

fn build_command(
    device: &Arc<Device>,
    connection: &dyn Connection,
    action: DeviceAction,
) -> Result<Command> {
    let command = match action {
        DeviceAction::GetProps { names } => {
            let props = names
                .iter()
                .map(|name| {
                    Prop::from_name(name).ok_or_else(|| anyhow!("Unknown property: {}", name))
                })
                .collect::<Result<Vec<_>>>()?;
            device.get_props(&props)?
        }
        DeviceAction::SetPower { state, duration } => {
            device.set_power(state == OnOff::On, None, Some(FadeEffect::of(duration)))?
        }
        DeviceAction::Toggle => device.toggle()?,
        DeviceAction::SetBright {
            brightness,
            duration,
        } => device.set_bright(brightness, Some(FadeEffect::of(duration)))?,
        DeviceAction::GetCron => device.cron_get(CronType::PowerOff)?,
        DeviceAction::Raw { method, params } => {
            let params: Vec<Value> =
                serde_json::from_str(&params).context("Parameters must be a JSON array")?;
            Command::custom(connection.next_message_id(), &method, params, None)
        }
    };
    Ok(command)
}

async fn send_and_wait(device: &Arc<Device>, command: Command, timeout: Duration) -> Result<Reply> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let command = command.on_reply(move |reply| {
        let _ = reply_tx.send(reply.clone());
    });
    info!("Sending {}", command);
    device.send(command)?;
    tokio::time::timeout(timeout, reply_rx)
        .await
        .context("No reply before the timeout")?
        .context("Connection closed before the reply arrived")
}

fn print_reply(reply: &Reply) {
    match reply.kind() {
        ReplyKind::Result(values) => {
            let values: Vec<String> = values.iter().map(Value::to_string).collect();
            println!("Result: {}", values.join(", "));
        }
        ReplyKind::Props(props) => {
            for (prop, value) in props.iter() {
                println!("{}: {}", prop, value.to_raw());
            }
        }
        ReplyKind::Cron(cron) if cron.is_none() => println!("No timer set"),
        ReplyKind::Cron(cron) => println!("Power off in {} minute(s)", cron.delay),
        ReplyKind::Error { code, message } => println!("Error {}: {}", code, message),
    }
}
