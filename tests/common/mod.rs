#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(dead_code)]

use std::time::Duration;
use tokio::time::Instant;

/// Reserve an ephemeral port: bind to port 0, note what the OS handed out,
/// and release it for the server under test to claim.
pub fn reserve_port() -> u16 {
    let listener =
        std::net::TcpListener::bind("127.0.0.1:0").expect("could not reserve an ephemeral port");
    listener
        .local_addr()
        .expect("reserved port has no local addr")
        .port()
}

/// Poll until something accepts TCP connections on the port, giving up at
/// the deadline.
pub async fn wait_until_listening(port: u16, deadline: Duration) -> bool {
    let give_up = Instant::now() + deadline;
    loop {
        if tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_ok()
        {
            return true;
        }
        if Instant::now() >= give_up {
            eprintln!("nothing is listening on port {port} after {deadline:?}");
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}
