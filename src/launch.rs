//! Daemon argument vector construction.

use std::path::Path;

const SOCKET_FLAG: &str = "extensions_socket";

/// How the derived socket flag's value is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketQuoting {
    /// `--extensions_socket=<path>`
    Bare,
    /// `--extensions_socket="<path>"`, needed where the shell splits pipe paths.
    Quoted,
}

impl SocketQuoting {
    pub fn native() -> Self {
        if cfg!(windows) {
            SocketQuoting::Quoted
        } else {
            SocketQuoting::Bare
        }
    }
}

/// Prefixes every flag with `--` and appends a socket flag unless one was given.
pub fn build_args(flags: &[String], socket: &Path) -> Vec<String> {
    build_args_with(flags, socket, SocketQuoting::native())
}

pub fn build_args_with(flags: &[String], socket: &Path, quoting: SocketQuoting) -> Vec<String> {
    let socket_prefix = format!("{SOCKET_FLAG}=");
    let mut has_socket = false;

    let mut args: Vec<String> = flags
        .iter()
        .map(|flag| {
            if flag.starts_with(&socket_prefix) {
                has_socket = true;
            }
            format!("--{flag}")
        })
        .collect();

    if !has_socket {
        let arg = match quoting {
            SocketQuoting::Bare => format!("--{SOCKET_FLAG}={}", socket.display()),
            SocketQuoting::Quoted => format!("--{SOCKET_FLAG}=\"{}\"", socket.display()),
        };
        args.push(arg);
    }

    args
}
