//! Mock simulator binary for integration testing
//!
//! Accepts the simulator's command line (`[-H] [--rbb-port=0] [loader]
//! image`), listens on a TCP port and announces it the way the real
//! simulator does. Each debugger connection receives one line, `halted`
//! or `running`, which `mock_gdb` uses to pick the initial hart state.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::Path;

/// Port used when no dynamic-port flag is given
const FIXED_PORT: u16 = 9824;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let halted = args.iter().any(|a| a == "-H");
    let dynamic = args.iter().any(|a| a.starts_with("--rbb-port=0"));
    let image = args.iter().rev().find(|a| !a.starts_with('-'));

    let Some(image) = image else {
        eprintln!("usage: mock_sim [-H] [--rbb-port=0] [loader] image");
        std::process::exit(1);
    };
    if !Path::new(image).exists() {
        eprintln!("couldn't open ELF program: {}", image);
        std::process::exit(1);
    }

    let port = if dynamic { 0 } else { FIXED_PORT };
    let listener = match TcpListener::bind(("127.0.0.1", port)) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("bind failed: {}", e);
            std::process::exit(1);
        }
    };
    let port = listener.local_addr().map(|a| a.port()).unwrap_or(port);

    println!("Listening for remote bitbang connection on port {}", port);
    std::io::stdout().flush().ok();

    let greeting: &[u8] = if halted { b"halted\n" } else { b"running\n" };

    for stream in listener.incoming() {
        let Ok(mut stream) = stream else { continue };
        eprintln!("Accepted remote bitbang connection");
        if stream.write_all(greeting).is_err() {
            continue;
        }
        // Hold the connection until the debugger drops it
        let mut sink = [0u8; 256];
        while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
        eprintln!("Remote bitbang connection closed");
    }
}
