//! Stream Channel
//!
//! Owns the byte streams of one open turret connection. Inbound data is only
//! logged; outbound writes are fire-and-forget.

use crate::domain::models::DeviceDescriptor;
use crate::infrastructure::bluetooth::connection::{
    CloseHandle, InputStream, OutputStream, Streams,
};
use std::fmt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const READ_BUFFER_SIZE: usize = 1024;

type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Runs the close callback when the read task ends, including on abort.
struct CloseGuard(Option<CloseCallback>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback();
        }
    }
}

pub struct StreamChannel {
    device: DeviceDescriptor,
    strategy: String,
    input: Option<InputStream>,
    output: Option<OutputStream>,
    read_task: Option<JoinHandle<()>>,
    on_closed: Option<CloseCallback>,
    close: Option<Box<dyn CloseHandle>>,
}

impl StreamChannel {
    /// Wrap the streams of a freshly connected socket.
    ///
    /// A stream that could not be acquired leaves the channel inert in that
    /// direction.
    pub fn new(device: DeviceDescriptor, strategy: impl Into<String>, streams: Streams) -> Self {
        let input = match streams.input {
            Ok(input) => Some(input),
            Err(e) => {
                error!(device = %device, error = %e, "Failed to acquire socket input stream");
                None
            }
        };
        let output = match streams.output {
            Ok(output) => Some(output),
            Err(e) => {
                error!(device = %device, error = %e, "Failed to acquire socket output stream");
                None
            }
        };

        Self {
            device,
            strategy: strategy.into(),
            input,
            output,
            read_task: None,
            on_closed: None,
            close: streams.close,
        }
    }

    /// Register a callback fired once when the read loop stops.
    pub fn on_read_closed(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.on_closed = Some(Box::new(callback));
    }

    /// Spawn the read loop. Does nothing if it already runs or there is no
    /// input stream.
    pub fn start_reading(&mut self) {
        let Some(mut input) = self.input.take() else {
            warn!(device = %self.device, "No input stream, read loop not started");
            return;
        };

        let device = self.device.to_string();
        let guard = CloseGuard(self.on_closed.take());

        self.read_task = Some(tokio::spawn(async move {
            let _guard = guard;
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                match input.read(&mut buffer).await {
                    Ok(0) => {
                        info!(device = %device, "Input stream closed by peer");
                        break;
                    }
                    Ok(count) => {
                        debug!(
                            device = %device,
                            "Received {} byte(s): {:?}",
                            count,
                            &buffer[..count]
                        );
                    }
                    Err(e) => {
                        warn!(device = %device, error = %e, "Input stream no longer connected");
                        break;
                    }
                }
            }
        }));
    }

    /// Write `bytes` to the turret. Failures are logged and the bytes dropped.
    pub async fn write(&mut self, bytes: &[u8]) {
        let Some(output) = self.output.as_mut() else {
            warn!(device = %self.device, "No output stream, dropping {:?}", bytes);
            return;
        };

        debug!(device = %self.device, "Sending {} byte(s): {:?}", bytes.len(), bytes);
        let result = match output.write_all(bytes).await {
            Ok(()) => output.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(device = %self.device, error = %e, "Failed to send data to device");
        }
    }

    /// Close the connection. Safe to call repeatedly or on a dead channel.
    ///
    /// Both streams are dropped before the close handle runs.
    pub async fn shutdown(&mut self) {
        if let Some(mut output) = self.output.take() {
            if let Err(e) = output.shutdown().await {
                debug!(device = %self.device, error = %e, "Output stream already closed");
            }
        }
        self.input = None;
        if let Some(task) = self.read_task.take() {
            task.abort();
            // Resolves once the task, and the input it owns, is dropped
            let _ = task.await;
        }
        if let Some(mut close) = self.close.take() {
            if let Err(e) = close.close().await {
                warn!(device = %self.device, error = %e, "Failed to release connection");
            }
        }
        info!(device = %self.device, "Connection shut down");
    }

    pub fn is_reading(&self) -> bool {
        self.read_task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// Name of the strategy that opened this connection
    pub fn strategy(&self) -> &str {
        &self.strategy
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        let Some(mut close) = self.close.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let device = self.device.to_string();
                runtime.spawn(async move {
                    if let Err(e) = close.close().await {
                        warn!(device = %device, error = %e, "Failed to release connection");
                    }
                });
            }
            Err(_) => warn!(device = %self.device, "Channel dropped outside the runtime, link not released"),
        }
    }
}

impl fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("device", &self.device)
            .field("strategy", &self.strategy)
            .field("has_output", &self.output.is_some())
            .field("reading", &self.is_reading())
            .finish()
    }
}
