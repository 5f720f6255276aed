use std::sync::Arc;

use dashmap::DashMap;
use tokio::{
    io::AsyncWriteExt,
    net::tcp::OwnedWriteHalf,
    sync::{Mutex, mpsc::Receiver},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::transport::models::{OutboundFrame, Outgoing};

pub fn respond(
    sockets: Arc<DashMap<Uuid, Arc<Mutex<OwnedWriteHalf>>>>,
    mut out_rx: Receiver<Outgoing>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(outgoing) = out_rx.recv().await {
            let (connection, frame) = match outgoing {
                Outgoing::Frame { connection, frame } => (connection, frame),
                Outgoing::Close { connection } => {
                    if let Some((_, socket)) = sockets.remove(&connection) {
                        if let Err(e) = socket.lock().await.shutdown().await {
                            tracing::debug!("Failed to shut down {}: {}", connection, e);
                        }
                    }
                    continue;
                }
            };

            // The map guard must not be held across the write.
            let Some(socket) = sockets.get(&connection).map(|s| s.clone()) else {
                tracing::warn!("Socket not found for connection {}", connection);
                continue;
            };

            if let Err(e) = write_frame(&socket, &frame).await {
                tracing::warn!("Failed to write to connection {}: {}", connection, e);
                sockets.remove(&connection);
            }
        }
    })
}

async fn write_frame(
    socket: &Mutex<OwnedWriteHalf>,
    frame: &OutboundFrame,
) -> std::io::Result<()> {
    let mut message = serde_json::to_vec(frame)?;
    message.push(b'\n');

    let mut stream = socket.lock().await;
    stream.write_all(&message).await?;
    stream.flush().await
}
