//! Line-oriented client for a kvlite server.
//!
//! `kvlite-cli [host:port]` opens an interactive prompt; `kvlite-cli script
//! [host:port]` runs a fixed smoke-test sequence against a live server and
//! prints every exchange.

use std::io::{self, BufRead, Read, Write};
use std::net::TcpStream;
use std::process::ExitCode;
use std::time::Duration;

const DEFAULT_ADDR: &str = "127.0.0.1:6380";
const RESPONSE_BUF_LEN: usize = 4096;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

const SCRIPT: &[&str] = &[
    "PING",
    "SET mykey hello",
    "GET mykey",
    "EXISTS mykey",
    "SET counter 10",
    "INCR counter",
    "INCR counter",
    "DECR counter",
    "SET tempkey temporary EX 5",
    "TTL tempkey",
    "KEYS *",
    "DEL mykey",
    "EXISTS mykey",
];

fn send_command(stream: &mut TcpStream, line: &str) -> io::Result<String> {
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\r\n")?;
    // One bounded read; replies are small and arrive in one burst.
    let mut buf = [0u8; RESPONSE_BUF_LEN];
    let n = stream.read(&mut buf)?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "server closed the connection",
        ));
    }
    Ok(String::from_utf8_lossy(&buf[..n]).trim_end().to_string())
}

fn interactive(stream: &mut TcpStream) -> io::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "kvlite> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = send_command(stream, line)?;
        println!("{reply}");
        if line.eq_ignore_ascii_case("QUIT") {
            break;
        }
    }
    Ok(())
}

fn script(stream: &mut TcpStream) -> io::Result<()> {
    for line in SCRIPT {
        let reply = send_command(stream, line)?;
        println!("> {line}");
        println!("{reply}");
    }
    let reply = send_command(stream, "QUIT")?;
    println!("> QUIT");
    println!("{reply}");
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (scripted, addr) = match args.first().map(String::as_str) {
        Some("script") => (true, args.get(1).cloned()),
        Some(addr) => (false, Some(addr.to_string())),
        None => (false, None),
    };
    let addr = addr.unwrap_or_else(|| DEFAULT_ADDR.to_string());

    let mut stream = match TcpStream::connect(&addr) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("could not connect to {addr}: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
        eprintln!("failed to set read timeout: {e}");
        return ExitCode::FAILURE;
    }
    println!("connected to {addr}");

    let result = if scripted {
        script(&mut stream)
    } else {
        interactive(&mut stream)
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("session error: {e}");
            ExitCode::FAILURE
        }
    }
}
