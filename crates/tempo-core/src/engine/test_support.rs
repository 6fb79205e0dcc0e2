//! A minimal in-process HTTP stub used by the end-to-end scenario tests:
//! bind `127.0.0.1:0`, spawn an accept loop, write a fixed response.
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Spawns a server that answers every connection with `status_code` and
/// then closes it. Returns its bound address and the accept-loop handle;
/// the caller aborts the handle once the scenario is done.
pub(crate) async fn spawn_http_stub(status_code: u16) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub listener");
    let addr = listener.local_addr().expect("read stub listener addr");
    let reason = reason_phrase(status_code);
    let response = format!(
        "HTTP/1.1 {status_code} {reason}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
    );

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let response = response.clone();
            tokio::spawn(async move {
                let mut buf = [0_u8; 1024];
                // Best-effort drain of the request; virtual users always
                // send a complete request before expecting a reply.
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, handle)
}

fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        200 => "OK",
        500 => "Internal Server Error",
        _ => "OK",
    }
}
