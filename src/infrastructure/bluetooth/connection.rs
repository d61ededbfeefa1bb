//! Connection Strategies
//!
//! Opening an RFCOMM stream is a two-step affair: build a socket for the
//! device, then connect it. Each [`ConnectionStrategy`] is one way of building
//! that socket; the link tries them in order until one connects.
//!
//! On Linux the sockets are BlueZ RFCOMM TTY nodes (`/dev/rfcommN`) managed
//! through the `sdptool` and `rfcomm` utilities.

use crate::domain::models::DeviceDescriptor;
use crate::domain::settings::LinkSettings;
use crate::infrastructure::bluetooth::error::LinkError;
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::unix::pipe;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;
pub type OutputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Both directions of a connected socket. Either side may have failed to open.
pub struct Streams {
    pub input: io::Result<InputStream>,
    pub output: io::Result<OutputStream>,
    /// Tears down the link once both streams are dropped
    pub close: Option<Box<dyn CloseHandle>>,
}

impl Streams {
    /// Split a bidirectional transport into its two halves.
    pub fn split<T>(transport: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (input, output) = tokio::io::split(transport);
        Self {
            input: Ok(Box::new(input)),
            output: Ok(Box::new(output)),
            close: None,
        }
    }
}

/// Releases what a connected socket holds beyond its streams.
#[async_trait]
pub trait CloseHandle: Send {
    async fn close(&mut self) -> Result<(), LinkError>;
}

/// A socket built for a device but not necessarily connected yet
#[async_trait]
pub trait RfcommSocket: Send {
    async fn connect(&mut self) -> Result<(), LinkError>;

    /// Release whatever the socket holds. Safe on an unconnected socket.
    async fn close(&mut self) -> Result<(), LinkError>;

    /// Hand the connected streams over to a channel.
    fn into_streams(self: Box<Self>) -> Streams;
}

/// One way of building a socket for the turret
#[async_trait]
pub trait ConnectionStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn create_socket(
        &self,
        device: &DeviceDescriptor,
    ) -> Result<Box<dyn RfcommSocket>, LinkError>;
}

/// Try each strategy in order, returning the name of the one that connected
/// together with its streams, or a reason listing every failure.
///
/// Sockets that were built but failed to connect are closed before moving on.
pub async fn connect_with_fallback(
    strategies: &[Arc<dyn ConnectionStrategy>],
    device: &DeviceDescriptor,
) -> Result<(String, Streams), String> {
    let mut failures = Vec::new();

    for strategy in strategies {
        info!(strategy = strategy.name(), device = %device, "Attempting connection");

        let mut socket = match strategy.create_socket(device).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(strategy = strategy.name(), error = %e, "Failed to initialize socket");
                failures.push(e.to_string());
                continue;
            }
        };

        match socket.connect().await {
            Ok(()) => {
                info!(strategy = strategy.name(), device = %device, "Connected");
                return Ok((strategy.name().to_string(), socket.into_streams()));
            }
            Err(e) => {
                warn!(strategy = strategy.name(), error = %e, "Failed to connect, trying fallback");
                failures.push(e.to_string());
                if let Err(close_err) = socket.close().await {
                    error!(strategy = strategy.name(), error = %close_err, "Failed to close socket");
                }
            }
        }
    }

    if failures.is_empty() {
        failures.push("no connection strategies configured".to_string());
    }
    Err(failures.join("; "))
}

/// Build the configured strategy list: service record first, then the fixed
/// channel, then the optional TCP bridge.
pub fn strategies_from_settings(link: &LinkSettings) -> Vec<Arc<dyn ConnectionStrategy>> {
    let mut strategies: Vec<Arc<dyn ConnectionStrategy>> = vec![
        Arc::new(ServiceRecordStrategy {
            service_uuid: link.service_uuid.clone(),
            device_index: link.rfcomm_device_index,
        }),
        Arc::new(ChannelStrategy {
            channel: link.fallback_channel,
            device_index: link.rfcomm_device_index,
        }),
    ];
    if let Some(address) = &link.tcp_bridge {
        strategies.push(Arc::new(TcpBridgeStrategy {
            address: address.clone(),
        }));
    }
    strategies
}

/// Resolves the RFCOMM channel from the turret's SDP service record.
pub struct ServiceRecordStrategy {
    pub service_uuid: String,
    pub device_index: u8,
}

#[async_trait]
impl ConnectionStrategy for ServiceRecordStrategy {
    fn name(&self) -> &str {
        "service-record"
    }

    async fn create_socket(
        &self,
        device: &DeviceDescriptor,
    ) -> Result<Box<dyn RfcommSocket>, LinkError> {
        let output = run_tool(
            "sdptool",
            &[
                "search",
                "--bdaddr",
                device.address.as_str(),
                self.service_uuid.as_str(),
            ],
        )
        .await
        .map_err(|e| LinkError::SocketConstruction {
            strategy: self.name().to_string(),
            reason: e.to_string(),
        })?;

        let channel =
            parse_sdp_channel(&output).ok_or_else(|| LinkError::ServiceNotFound {
                uuid: self.service_uuid.clone(),
                address: device.address.clone(),
            })?;
        debug!(channel, "Resolved service record");

        Ok(Box::new(RfcommNodeSocket::new(
            self.name(),
            self.device_index,
            &device.address,
            channel,
        )))
    }
}

/// Connects straight to a fixed RFCOMM channel, for devices whose service
/// record cannot be queried.
pub struct ChannelStrategy {
    pub channel: u8,
    pub device_index: u8,
}

#[async_trait]
impl ConnectionStrategy for ChannelStrategy {
    fn name(&self) -> &str {
        "fixed-channel"
    }

    async fn create_socket(
        &self,
        device: &DeviceDescriptor,
    ) -> Result<Box<dyn RfcommSocket>, LinkError> {
        Ok(Box::new(RfcommNodeSocket::new(
            self.name(),
            self.device_index,
            &device.address,
            self.channel,
        )))
    }
}

/// Serial bridge or turret simulator reachable over TCP
pub struct TcpBridgeStrategy {
    pub address: String,
}

#[async_trait]
impl ConnectionStrategy for TcpBridgeStrategy {
    fn name(&self) -> &str {
        "tcp-bridge"
    }

    async fn create_socket(
        &self,
        _device: &DeviceDescriptor,
    ) -> Result<Box<dyn RfcommSocket>, LinkError> {
        if self.address.trim().is_empty() {
            return Err(LinkError::SocketConstruction {
                strategy: self.name().to_string(),
                reason: "empty bridge address".to_string(),
            });
        }
        Ok(Box::new(TcpBridgeSocket {
            address: self.address.clone(),
            stream: None,
        }))
    }
}

/// RFCOMM TTY node bound with `rfcomm bind`
struct RfcommNodeSocket {
    strategy: String,
    device_index: u8,
    address: String,
    channel: u8,
    bound: bool,
    node: Option<(pipe::Receiver, pipe::Sender)>,
}

impl RfcommNodeSocket {
    fn new(strategy: &str, device_index: u8, address: &str, channel: u8) -> Self {
        Self {
            strategy: strategy.to_string(),
            device_index,
            address: address.to_string(),
            channel,
            bound: false,
            node: None,
        }
    }

    fn node_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/rfcomm{}", self.device_index))
    }

    fn connect_error(&self, reason: impl ToString) -> LinkError {
        LinkError::Connect {
            strategy: self.strategy.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl RfcommSocket for RfcommNodeSocket {
    async fn connect(&mut self) -> Result<(), LinkError> {
        let index = self.device_index.to_string();
        let channel = self.channel.to_string();

        // A stale binding from an earlier session would make `bind` fail
        if let Err(e) = run_tool("rfcomm", &["release", index.as_str()]).await {
            debug!(error = %e, "No stale binding released");
        }
        run_tool(
            "rfcomm",
            &["bind", index.as_str(), self.address.as_str(), channel.as_str()],
        )
        .await
        .map_err(|e| self.connect_error(e))?;
        self.bound = true;

        let path = self.node_path();
        let node = open_node(path.clone())
            .await
            .map_err(|e| self.connect_error(format!("{}: {}", path.display(), e)))?;

        // Frames are binary; 10 ticks is a newline byte
        let node_arg = path.to_string_lossy();
        if let Err(e) = run_tool("stty", &["-F", &*node_arg, "raw", "-echo"]).await {
            warn!(error = %e, "Could not switch {} to raw mode", path.display());
        }

        self.node = Some(node);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        self.node = None;
        if self.bound {
            self.bound = false;
            release_node(self.device_index).await?;
        }
        Ok(())
    }

    fn into_streams(self: Box<Self>) -> Streams {
        let close: Option<Box<dyn CloseHandle>> = self.bound.then(|| {
            Box::new(NodeRelease {
                device_index: self.device_index,
            }) as Box<dyn CloseHandle>
        });
        match self.node {
            Some((input, output)) => Streams {
                input: Ok(Box::new(input)),
                output: Ok(Box::new(output)),
                close,
            },
            None => Streams {
                input: Err(io::Error::new(io::ErrorKind::NotConnected, "socket not connected")),
                output: Err(io::Error::new(io::ErrorKind::NotConnected, "socket not connected")),
                close,
            },
        }
    }
}

/// Runs `rfcomm release` for a node handed over to a channel.
struct NodeRelease {
    device_index: u8,
}

#[async_trait]
impl CloseHandle for NodeRelease {
    async fn close(&mut self) -> Result<(), LinkError> {
        release_node(self.device_index).await
    }
}

async fn release_node(device_index: u8) -> Result<(), LinkError> {
    let index = device_index.to_string();
    run_tool("rfcomm", &["release", index.as_str()]).await?;
    info!("Released /dev/rfcomm{}", device_index);
    Ok(())
}

/// Open a TTY node as reactor-driven streams.
///
/// The blocking open is what brings the RFCOMM link up. The streams then
/// use a second, non-blocking descriptor so that dropping them closes the
/// node even while a read is pending.
async fn open_node(path: PathBuf) -> io::Result<(pipe::Receiver, pipe::Sender)> {
    let link_path = path.clone();
    let link = tokio::task::spawn_blocking(move || {
        OpenOptions::new().read(true).write(true).open(link_path)
    })
    .await
    .map_err(io::Error::other)??;

    let file = open_non_blocking(&path)?;
    drop(link);

    let input = pipe::Receiver::from_file_unchecked(file.try_clone()?)?;
    let output = pipe::Sender::from_file_unchecked(file)?;
    Ok((input, output))
}

fn open_non_blocking(path: &Path) -> io::Result<std::fs::File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

struct TcpBridgeSocket {
    address: String,
    stream: Option<TcpStream>,
}

#[async_trait]
impl RfcommSocket for TcpBridgeSocket {
    async fn connect(&mut self) -> Result<(), LinkError> {
        let stream = TcpStream::connect(self.address.as_str())
            .await
            .map_err(|e| LinkError::Connect {
                strategy: "tcp-bridge".to_string(),
                reason: format!("{}: {}", self.address, e),
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle on bridge socket");
        }
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        self.stream = None;
        Ok(())
    }

    fn into_streams(self: Box<Self>) -> Streams {
        match self.stream {
            Some(stream) => {
                let (input, output) = stream.into_split();
                Streams {
                    input: Ok(Box::new(input)),
                    output: Ok(Box::new(output)),
                    close: None,
                }
            }
            None => Streams {
                input: Err(io::Error::new(io::ErrorKind::NotConnected, "bridge not connected")),
                output: Err(io::Error::new(io::ErrorKind::NotConnected, "bridge not connected")),
                close: None,
            },
        }
    }
}

/// Run a BlueZ utility and return its stdout.
async fn run_tool(program: &str, args: &[&str]) -> Result<String, LinkError> {
    debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program).args(args).output().await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(LinkError::Tool {
            program: program.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Extract the RFCOMM channel from `sdptool search` output.
pub fn parse_sdp_channel(output: &str) -> Option<u8> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("Channel:")
            .and_then(|channel| channel.trim().parse().ok())
    })
}
