//! Minimal HTTP server: `cargo run --example hello_server` then
//! `curl http://127.0.0.1:7878/`.

use bytes::Bytes;
use selwire_http::{Exchange, Result, ServerBuilder};

fn main() -> Result<()> {
    let server = ServerBuilder::new()
        .bind("127.0.0.1:7878".parse().unwrap())
        .workers(2)
        .launch(|ex: &mut Exchange<'_>| -> Result<()> {
            ex.add_header("Content-Type", "text/plain");
            let body = format!("hello from {}\n", ex.request().target());
            ex.write(Bytes::from(body), false)?;
            Ok(())
        })?;

    println!("listening on {}", server.local_addr());
    server.join_forever();
    Ok(())
}
