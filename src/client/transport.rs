//! Unix socket driver for [`Client`](super::Client).
//!
//! Owns the stream and nothing else: it reports connect and disconnect
//! to the client core, feeds decoded frames in, and writes whatever the
//! core queues out. On EOF or I/O error it waits `reconnect_interval` and
//! dials again.
//!
//! ```text
//! ClientCore <──frames── read half ◄── Unix Socket ──► write half ◄──mpsc── ClientCore
//! ```

use std::path::PathBuf;
use std::sync::Weak;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use super::ClientCore;
use crate::socket::framing::FrameDecoder;

/// Connect, pump frames until the stream ends, repeat.
///
/// Exits once the client core has been dropped.
pub(crate) async fn run(core: Weak<ClientCore>, path: PathBuf, reconnect_interval: Duration) {
    loop {
        match UnixStream::connect(&path).await {
            Ok(stream) => {
                log::info!("[Client] Connected to {}", path.display());
                let (reader, writer) = stream.into_split();
                let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
                let writer_task = tokio::spawn(write_loop(writer, frame_rx));

                let Some(client) = core.upgrade() else {
                    writer_task.abort();
                    return;
                };
                client.on_transport_connected(frame_tx);
                drop(client);

                let outcome = read_loop(&core, reader).await;
                writer_task.abort();

                let Some(client) = core.upgrade() else {
                    return;
                };
                if let Err(e) = outcome {
                    client.report_error(e);
                }
                client.on_transport_disconnected();
            }
            Err(e) => {
                let Some(client) = core.upgrade() else {
                    return;
                };
                client.report_error(format!("Failed to connect to {}: {e}", path.display()));
            }
        }

        tokio::time::sleep(reconnect_interval).await;
    }
}

/// Read until EOF. `Err` carries a description of a read or decode failure.
async fn read_loop(core: &Weak<ClientCore>, mut reader: OwnedReadHalf) -> Result<(), String> {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                log::info!("[Client] Socket EOF, server disconnected");
                return Ok(());
            }
            Ok(n) => n,
            Err(e) => return Err(format!("Socket read error: {e}")),
        };
        let frames = decoder
            .feed(&buf[..n])
            .map_err(|e| format!("Frame decode error: {e}"))?;

        let Some(client) = core.upgrade() else {
            return Ok(());
        };
        for frame in frames {
            client.handle_frame(frame);
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut frame_rx: UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = frame_rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            log::error!("[Client] Socket write error: {e}");
            break;
        }
    }
}
