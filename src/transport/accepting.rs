use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::Sender,
    task::JoinHandle,
};

use crate::constants::READ_TX_ERR;

pub fn accept_connections(read_tx: Sender<TcpStream>, listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    tracing::debug!("Accepted connection from {}", peer);
                    read_tx.send(socket).await.expect(READ_TX_ERR);
                }
                Err(e) => tracing::warn!("Failed to accept connection: {}", e),
            }
        }
    })
}
