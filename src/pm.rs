//! PM Client: a single logical JSON request/reply over a Unix-domain
//! stream pipe to the policy manager, following the original's
//! half-close-then-read-to-EOF protocol exclusively (see `DESIGN.md` for
//! why the other two historical variants are not implemented).

use crate::error::{Error, Result};
use crate::property::PropertyDocument;
use mio::net::UnixStream;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::path::PathBuf;

const DEFAULT_SOCKET_NAME: &str = "neat_pm_socket";

/// Resolves the PM socket path from `NEAT_PM_SOCKET`, falling back to
/// `$HOME/.neat/neat_pm_socket`. Takes an injectable environment lookup so
/// this is unit-testable without touching the process environment.
pub fn resolve_socket_path(env: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
    if let Some(path) = env("NEAT_PM_SOCKET") {
        return Ok(PathBuf::from(path));
    }
    let home = env("HOME").ok_or(Error::PmUnavailable)?;
    Ok(PathBuf::from(home).join(".neat").join(DEFAULT_SOCKET_NAME))
}

#[derive(Debug)]
enum State {
    Writing { written: usize },
    ReadingUntilEof,
}

/// One in-flight PM request. Created by [`PmClient::send`]; driven to
/// completion by repeated calls to [`PmClient::handle_event`] from the
/// reactor as the underlying socket becomes readable/writable.
pub struct PmClient {
    stream: UnixStream,
    request: Vec<u8>,
    read_buf: Vec<u8>,
    state: State,
}

impl PmClient {
    /// Connects and queues `doc` for sending. The connect itself is
    /// non-blocking; the reactor must poll this client for writability
    /// before any progress is made.
    pub fn send(doc: &PropertyDocument) -> Result<Self> {
        let path = resolve_socket_path(|k| std::env::var(k).ok())?;
        let stream = UnixStream::connect(&path).map_err(|_| Error::PmUnavailable)?;
        let request = doc.to_wire()?.into_bytes();

        Ok(Self {
            stream,
            request,
            read_buf: Vec::new(),
            state: State::Writing { written: 0 },
        })
    }

    pub fn stream(&mut self) -> &mut UnixStream {
        &mut self.stream
    }

    /// Drives one step of the protocol. Returns `Ok(Some(reply))` once the
    /// full reply has been parsed, `Ok(None)` if more I/O is needed, and
    /// `Err` on a fatal I/O or parse failure.
    pub fn handle_event(&mut self) -> Result<Option<PropertyDocument>> {
        loop {
            match &mut self.state {
                State::Writing { written } => match self.stream.write(&self.request[*written..]) {
                    Ok(0) => return Err(Error::PmUnavailable),
                    Ok(n) => {
                        *written += n;
                        if *written == self.request.len() {
                            self.stream
                                .shutdown(Shutdown::Write)
                                .map_err(Error::IoError)?;
                            self.state = State::ReadingUntilEof;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(e) => return Err(Error::IoError(e)),
                },
                State::ReadingUntilEof => {
                    let mut chunk = [0u8; 4096];
                    match self.stream.read(&mut chunk) {
                        Ok(0) => {
                            let doc = serde_json::from_slice(&self.read_buf)
                                .map_err(|_| Error::InvalidProperty)?;
                            return Ok(Some(doc));
                        }
                        Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) => return Err(Error::IoError(e)),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_takes_precedence_over_home_fallback() {
        let path = resolve_socket_path(|k| match k {
            "NEAT_PM_SOCKET" => Some("/run/neat/pm.sock".to_string()),
            "HOME" => Some("/home/alice".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(path, PathBuf::from("/run/neat/pm.sock"));
    }

    #[test]
    fn falls_back_to_home_dotfile() {
        let path = resolve_socket_path(|k| match k {
            "HOME" => Some("/home/alice".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(path, PathBuf::from("/home/alice/.neat/neat_pm_socket"));
    }

    #[test]
    fn fails_without_env_var_or_home() {
        let result = resolve_socket_path(|_| None);
        assert!(matches!(result, Err(Error::PmUnavailable)));
    }
}
