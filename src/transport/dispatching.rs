use std::sync::Arc;

use tokio::{
    sync::mpsc::{self, Receiver, Sender},
    task::JoinHandle,
};

use crate::{
    constants::OUT_TX_ERR,
    core::{domain::Response, pipeline::running::Pipeline},
    transport::{
        mappers::decode_frame,
        models::{Delivery, OutboundFrame, Outgoing},
    },
};

/// Runs every delivery on its own task; the delivery is acknowledged once its
/// terminal reply has been queued.
pub fn dispatch_deliveries(
    out_tx: Sender<Outgoing>,
    mut delivery_rx: Receiver<Delivery>,
    pipeline: Arc<Pipeline>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = delivery_rx.recv().await {
            tokio::spawn(handle_delivery(delivery, pipeline.clone(), out_tx.clone()));
        }
    })
}

#[tracing::instrument(skip_all, fields(connection = %delivery.connection))]
async fn handle_delivery(delivery: Delivery, pipeline: Arc<Pipeline>, out_tx: Sender<Outgoing>) {
    let connection = delivery.connection;
    let (correlation_id, request) = decode_frame(&delivery.line);

    match request {
        Ok(request) => {
            let (res_tx, mut res_rx) = mpsc::channel::<Response>(16);
            let handling = async move {
                pipeline.handle_request(request, &res_tx).await;
            };
            let forwarding = async {
                while let Some(response) = res_rx.recv().await {
                    let frame = OutboundFrame::reply(&correlation_id, &response);
                    send_frame(&out_tx, connection, frame).await;
                }
            };
            tokio::join!(handling, forwarding);
        }
        Err(e) => {
            tracing::warn!("Rejected malformed delivery: {}", e);
            let frame = OutboundFrame::reply(&correlation_id, &Response::internal_error(e));
            send_frame(&out_tx, connection, frame).await;
        }
    }

    send_frame(&out_tx, connection, OutboundFrame::ack(&correlation_id)).await;

    let elapsed = chrono::Utc::now() - delivery.received_at;
    tracing::info!(
        "Handled delivery {} in {} ms",
        correlation_id,
        elapsed.num_milliseconds()
    );
    drop(delivery.guard);
}

async fn send_frame(out_tx: &Sender<Outgoing>, connection: uuid::Uuid, frame: OutboundFrame) {
    out_tx
        .send(Outgoing::Frame { connection, frame })
        .await
        .expect(OUT_TX_ERR);
}
