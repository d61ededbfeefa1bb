//! Terminal console
//!
//! Each input line is one recognition cycle: candidate transcripts separated
//! by `|`. Lines starting with `/` control the link.

use crate::domain::models::{AppEvent, ConnectionState};
use crate::domain::parser;
use crate::infrastructure::bluetooth::channel::StreamChannel;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::LinkHandle;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const HELP: &str = "\
Say something like `tilt up five` or `fire`.
Separate alternative transcripts with `|`.
Commands: /scan /disconnect /state /help /quit";

pub struct Console<W> {
    link: LinkHandle,
    app_tx: mpsc::UnboundedSender<AppEvent>,
    events: mpsc::UnboundedReceiver<AppEvent>,
    channel: Option<StreamChannel>,
    out: W,
}

impl<W: AsyncWrite + Unpin> Console<W> {
    pub fn new(
        link: LinkHandle,
        app_tx: mpsc::UnboundedSender<AppEvent>,
        events: mpsc::UnboundedReceiver<AppEvent>,
        out: W,
    ) -> Self {
        Self {
            link,
            app_tx,
            events,
            channel: None,
            out,
        }
    }

    /// Serve `input` until `/quit` or end of input.
    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, input: R) -> anyhow::Result<()> {
        let mut lines = input.split(b'\n');
        loop {
            tokio::select! {
                line = lines.next_segment() => match line? {
                    Some(bytes) => match String::from_utf8(bytes) {
                        Ok(line) => {
                            if !self.handle_line(&line).await? {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Skipping input line that is not UTF-8");
                            self.say("Could not read that line").await?;
                        }
                    },
                    None => break,
                },
                Some(event) = self.events.recv() => self.handle_event(event).await?,
            }
        }

        // Commands already parsed still go out
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event).await?;
        }
        if let Some(mut channel) = self.channel.take() {
            channel.shutdown().await;
        }
        Ok(())
    }

    /// Returns `false` when the console should stop.
    async fn handle_line(&mut self, line: &str) -> anyhow::Result<bool> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(true);
        }

        match line {
            "/quit" => return Ok(false),
            "/scan" => {
                self.link.start_discovery();
                self.say("Scanning for turret...").await?;
            }
            "/disconnect" => {
                if let Some(mut channel) = self.channel.take() {
                    channel.shutdown().await;
                }
                self.link.disconnect();
                self.say("Disconnected").await?;
            }
            "/state" => {
                let state = format!("Link state: {:?}", self.link.state());
                self.say(&state).await?;
            }
            "/help" => self.say(HELP).await?,
            other if other.starts_with('/') => {
                let message = format!("Unknown command {}, try /help", other);
                self.say(&message).await?;
            }
            transcript => {
                let candidates: Vec<&str> = transcript.split('|').collect();
                let words = parser::words_from_candidates(&candidates);
                let command = parser::parse(&words);
                debug!(words = ?words, command = ?command, "Parsed transcript");
                let _ = self.app_tx.send(AppEvent::CommandParsed(command));
            }
        }
        Ok(true)
    }

    async fn handle_event(&mut self, event: AppEvent) -> anyhow::Result<()> {
        match event {
            AppEvent::ConnectionEstablished(channel) => {
                let message = format!(
                    "Connected to {} ({})",
                    channel.device(),
                    channel.strategy()
                );
                if let Some(mut old) = self.channel.replace(channel) {
                    old.shutdown().await;
                }
                self.say(&message).await?;
            }
            AppEvent::ConnectionFailed(reason) => {
                self.say(&format!("Connection failed: {}", reason)).await?;
            }
            AppEvent::DeviceNotFound => self.say("Turret not found").await?,
            AppEvent::CommandParsed(command) => {
                self.say(&command.describe()).await?;
                if command.is_valid() {
                    self.send_command(&protocol::encode(&command)).await?;
                }
            }
        }
        Ok(())
    }

    async fn send_command(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        // The link drops back to Idle when the turret goes away
        if self.link.state() != ConnectionState::Connected {
            if let Some(mut stale) = self.channel.take() {
                info!(device = %stale.device(), "Releasing lost connection");
                stale.shutdown().await;
            }
        }

        match self.channel.as_mut() {
            Some(channel) => channel.write(frame).await,
            None => self.say("Not connected, use /scan").await?,
        }
        Ok(())
    }

    async fn say(&mut self, text: &str) -> std::io::Result<()> {
        self.out.write_all(text.as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await
    }

    pub fn into_output(self) -> W {
        self.out
    }
}
