//! User-facing collaborator of a peer endpoint, plus a plain terminal implementation.

use std::io::{self, BufRead, Write};
use std::net::{SocketAddr, ToSocketAddrs};

use m4t_core::Notification;
use parking_lot::Mutex;

/// Answers the startup prompts and receives everything worth showing.
/// Called from the receive worker as well as the input loop.
pub trait Frontend: Send + Sync {
    /// Port to bind. `None` aborts startup.
    fn local_port(&self) -> Option<u16>;
    /// Where to send. `None` aborts startup.
    fn peer_target(&self) -> Option<SocketAddr>;
    fn on_message(&self, message_id: u16, text: &str);
    fn on_notification(&self, notification: &Notification);
    fn on_start(&self) {}
    fn on_shutdown(&self) {}
}

/// stdin/stdout front-end. Values given on the command line are used once; after that
/// (or when absent) the user is prompted.
pub struct TerminalFrontend {
    port: Mutex<Option<u16>>,
    target: Mutex<Option<String>>,
}

impl TerminalFrontend {
    pub fn new(port: Option<u16>, target: Option<String>) -> Self {
        Self {
            port: Mutex::new(port),
            target: Mutex::new(target),
        }
    }
}

/// Print `prompt` and read one trimmed line. `None` on end of input.
fn prompt(prompt: &str) -> Option<String> {
    println!("{prompt}");
    let _ = io::stdout().flush();
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

fn resolve(target: &str) -> Option<SocketAddr> {
    target.to_socket_addrs().ok()?.next()
}

impl Frontend for TerminalFrontend {
    fn local_port(&self) -> Option<u16> {
        if let Some(port) = self.port.lock().take() {
            return Some(port);
        }
        loop {
            let line = prompt("Please enter your desired operating port (0-65535):")?;
            match line.parse::<u16>() {
                Ok(port) => return Some(port),
                Err(_) => println!("Invalid input. Please enter a port between 0 and 65535."),
            }
        }
    }

    fn peer_target(&self) -> Option<SocketAddr> {
        if let Some(target) = self.target.lock().take() {
            match resolve(&target) {
                Some(addr) => return Some(addr),
                None => println!("Cannot resolve {target}."),
            }
        }
        loop {
            let line = prompt("Please enter your target's address and port (host:port):")?;
            if line.is_empty() {
                return None;
            }
            match resolve(&line) {
                Some(addr) if addr.port() != 0 => return Some(addr),
                _ => println!("Unknown host or invalid port. Please try again."),
            }
        }
    }

    fn on_message(&self, _message_id: u16, text: &str) {
        println!("{text}");
    }

    fn on_notification(&self, notification: &Notification) {
        match notification {
            Notification::BindFailed { .. } | Notification::ReceiveFailed { .. } => {
                eprintln!("{notification}")
            }
            other => println!("{other}"),
        }
    }

    fn on_start(&self) {
        println!("(Communication Start.)");
    }

    fn on_shutdown(&self) {
        println!("Goodbye!");
    }
}
