use peerlink::configuration::link_configuration::read_configuration_file;
use peerlink::logging::init_tracing;
use peerlink::{Configuration, Error, ErrorKind, Link};
use std::io::BufRead;
use std::sync::Arc;
use std::thread;
use tracing::Level;

/**
 * Two-terminal chat over a direct link. Run it on both machines with the
 * other side's address:
 *
 * `cargo run --example peer_link -- 42000 192.168.1.20:42001 [config.toml]`
 *
 * Every line typed is sent to the peer; an empty line closes the link.
 */
pub fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing(Level::INFO)?;

    let mut args = std::env::args().skip(1);
    let local_port: u16 = args.next().ok_or("missing local port")?.parse()?;
    let remote_url = args.next().ok_or("missing remote peer url")?;

    let configuration = match args.next() {
        Some(path) => read_configuration_file(path)?,
        None => Configuration::default(),
    };

    let link = Link::new(configuration);

    //Addresses to give to the other side
    for address in link.list_local_addresses(true)? {
        println!("reachable at {}:{}", address, local_port);
    }

    let connection = link.connect(&remote_url, local_port)?;
    println!("connected to {} ({} leg)", connection.peer(), connection.leg());

    let receiving = Arc::clone(&connection);
    let reader = thread::spawn(move || loop {
        match receiving.receive() {
            Ok(msg) => println!("peer: {}", String::from_utf8_lossy(&msg)),
            Err(e) => {
                match e.kind() {
                    ErrorKind::PeerDisconnected => println!("peer left"),
                    ErrorKind::Closed => {}
                    _ => println!("link lost: {}", e),
                }
                break;
            }
        }
    });

    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if line.is_empty() {
            break;
        }

        match connection.send(line.as_bytes()) {
            Ok(()) => {}
            Err(Error::Closed) => break,
            Err(e) => return Err(e.into()),
        }
    }

    link.disconnect();
    let _ = reader.join();

    Ok(())
}
