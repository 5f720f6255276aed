//! Line-delimited JSON over TCP: one request frame per line in, reply and
//! ack frames per line out.

pub mod accepting;
pub mod dispatching;
pub mod mappers;
pub mod models;
pub mod reading;
pub mod responding;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::{net::TcpListener, sync::mpsc};

use crate::{constants::MAX_FRAME_LEN, core::pipeline::running::Pipeline};

const CHANNEL_CAPACITY: usize = 100;

pub async fn serve(listener: TcpListener, pipeline: Arc<Pipeline>) {
    let sockets = Arc::new(DashMap::new());

    let (read_tx, read_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (delivery_tx, delivery_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let accepting = accepting::accept_connections(read_tx, listener);
    reading::read_sockets(
        sockets.clone(),
        read_rx,
        delivery_tx,
        out_tx.clone(),
        MAX_FRAME_LEN,
    );
    dispatching::dispatch_deliveries(out_tx, delivery_rx, pipeline);
    responding::respond(sockets, out_rx);

    if let Err(e) = accepting.await {
        tracing::error!("Accept loop stopped: {}", e);
    }
}
