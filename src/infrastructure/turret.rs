//! Turret Simulator
//!
//! Decodes command frames the way the turret firmware does and turns them
//! into motor control lines (`U7\n`, `F0\n`, ...). Used by the `simulate`
//! subcommand as a TCP stand-in for the real turret.

use crate::infrastructure::bluetooth::protocol::{FRAME_LEN, SERVICE_NAME};
use anyhow::Context;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// One motor instruction for the turret controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorCommand {
    pub kind: char,
    pub magnitude: u8,
}

impl MotorCommand {
    /// Line written to the motor controller, e.g. `R3\n`
    pub fn control_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for MotorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.magnitude)
    }
}

/// Decode one frame. Returns `None` for frames of the wrong length or with
/// an unknown opcode.
pub fn decode_frame(frame: &[u8]) -> Option<MotorCommand> {
    let [opcode, argument] = frame else {
        return None;
    };
    let (kind, magnitude) = match *opcode {
        0 => ('F', 0),
        1 => ('P', 0),
        2 => ('U', *argument),
        3 => ('D', *argument),
        4 => ('L', *argument),
        5 => ('R', *argument),
        _ => return None,
    };
    Some(MotorCommand { kind, magnitude })
}

/// Read frames from `reader` until end of stream, writing a control line to
/// `sink` for every valid one. Returns the number of commands executed.
pub async fn serve_connection<R, W>(mut reader: R, sink: &mut W) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frame = [0u8; FRAME_LEN];
    let mut executed = 0;
    loop {
        match reader.read_exact(&mut frame).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }

        match decode_frame(&frame) {
            Some(command) => {
                debug!(command = %command, "Executing");
                sink.write_all(command.control_line().as_bytes()).await?;
                sink.flush().await?;
                executed += 1;
            }
            None => warn!("Invalid command frame {:?}", frame),
        }
    }
    Ok(executed)
}

/// Accept controller connections on `listen`, one at a time.
pub async fn run_simulator(listen: SocketAddr, control_file: Option<PathBuf>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    info!(
        "{} simulator listening on {}",
        SERVICE_NAME,
        listener.local_addr()?
    );

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(peer = %peer, "Controller connected");

        let result = match &control_file {
            Some(path) => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .with_context(|| format!("opening {}", path.display()))?;
                serve_connection(stream, &mut file).await
            }
            None => serve_connection(stream, &mut tokio::io::stdout()).await,
        };

        match result {
            Ok(count) => info!(peer = %peer, "Controller disconnected after {} command(s)", count),
            Err(e) => warn!(peer = %peer, error = %e, "Controller connection dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command::{Command, Opcode};
    use crate::infrastructure::bluetooth::protocol::encode;
    use tokio::io::duplex;

    #[test]
    fn test_decode_movement() {
        assert_eq!(
            decode_frame(&[2, 7]),
            Some(MotorCommand {
                kind: 'U',
                magnitude: 7
            })
        );
        assert_eq!(decode_frame(&[5, 3]).unwrap().control_line(), "R3\n");
        assert_eq!(decode_frame(&[4, 1]).unwrap().control_line(), "L1\n");
        assert_eq!(decode_frame(&[3, 10]).unwrap().control_line(), "D10\n");
    }

    #[test]
    fn test_fire_and_prime_ignore_argument() {
        assert_eq!(decode_frame(&[0, 9]).unwrap().control_line(), "F0\n");
        assert_eq!(decode_frame(&[1, 0]).unwrap().control_line(), "P0\n");
    }

    #[test]
    fn test_invalid_frames() {
        assert_eq!(decode_frame(&[6, 0]), None);
        assert_eq!(decode_frame(&[42, 1]), None);
        assert_eq!(decode_frame(&[2]), None);
        assert_eq!(decode_frame(&[2, 1, 0]), None);
    }

    #[test]
    fn test_decodes_what_the_controller_sends() {
        let command = Command::new(Opcode::RotateLeft, 4).unwrap();
        assert_eq!(decode_frame(&encode(&command)).unwrap().control_line(), "L4\n");
    }

    #[tokio::test]
    async fn test_serve_skips_invalid_frames() {
        let (mut controller, turret) = duplex(64);
        controller.write_all(&[0, 0, 6, 0, 2, 5, 9]).await.unwrap();
        drop(controller);

        let mut sink = Vec::new();
        let executed = serve_connection(turret, &mut sink).await.unwrap();

        // the trailing half frame is dropped
        assert_eq!(executed, 2);
        assert_eq!(String::from_utf8(sink).unwrap(), "F0\nU5\n");
    }
}
