use std::{io, pin::pin, sync::Arc};

use dashmap::DashMap;
use futures::Stream;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader},
    net::{TcpStream, tcp::OwnedWriteHalf},
    sync::{
        Mutex,
        mpsc::{self, Receiver, Sender},
    },
    task::JoinHandle,
};
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::{
    constants::{DELIVERY_TX_ERR, OUT_TX_ERR},
    transport::models::{Delivery, Outgoing},
};

/// Splits every accepted socket, registers its write half and turns each
/// non-blank line into a [`Delivery`].
///
/// A connection is closed only once the peer hung up (or sent a line longer
/// than `max_line_len`) and every delivery read from it has been acknowledged.
pub fn read_sockets(
    sockets: Arc<DashMap<Uuid, Arc<Mutex<OwnedWriteHalf>>>>,
    mut read_rx: Receiver<TcpStream>,
    delivery_tx: Sender<Delivery>,
    out_tx: Sender<Outgoing>,
    max_line_len: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(socket) = read_rx.recv().await {
            let connection = Uuid::new_v4();

            let (read_half, write_half) = socket.into_split();
            sockets.insert(connection, Arc::new(Mutex::new(write_half)));

            let delivery_tx = delivery_tx.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let (guard, mut drained) = mpsc::channel::<()>(1);
                let mut lines = pin!(capped_lines(BufReader::new(read_half), max_line_len));

                while let Some(line) = lines.next().await {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            tracing::warn!("Failed to read from {}: {}", connection, e);
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }

                    delivery_tx
                        .send(Delivery {
                            connection,
                            received_at: chrono::Utc::now(),
                            line,
                            guard: guard.clone(),
                        })
                        .await
                        .expect(DELIVERY_TX_ERR);
                }

                drop(guard);
                // Resolves once the last in-flight delivery drops its guard.
                let _ = drained.recv().await;
                tracing::debug!("Connection {} drained", connection);
                out_tx
                    .send(Outgoing::Close { connection })
                    .await
                    .expect(OUT_TX_ERR);
            });
        }
    })
}

fn capped_lines<R>(reader: R, max_len: usize) -> impl Stream<Item = io::Result<String>>
where
    R: AsyncBufRead + Unpin,
{
    futures::stream::unfold(reader, move |mut reader| async move {
        read_line(&mut reader, max_len)
            .await
            .transpose()
            .map(|line| (line, reader))
    })
}

/// Reads one `\n`-terminated line without buffering more than `max_len + 1`
/// bytes of it. `Ok(None)` on a clean end of stream.
async fn read_line<R>(reader: &mut R, max_len: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(max_len as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line longer than {} bytes", max_len),
        ));
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
