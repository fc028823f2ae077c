//! Tor control protocol adapter.
//!
//! Speaks the line-based control protocol over TCP to build, extend and
//! close circuits, switch identity and query circuit status.
//!
//! Reference: https://spec.torproject.org/control-spec/

use std::path::PathBuf;

use async_trait::async_trait;
use charon_common::{CharonError, CircuitHandle, RelayId, RemoteCircuitState, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::ControlChannel;

/// How to authenticate to the control port
#[derive(Debug, Clone)]
pub enum TorAuth {
    /// Control port without authentication
    None,
    /// HashedControlPassword
    Password(String),
    /// CookieAuthentication file
    Cookie(PathBuf),
}

/// Tor control port client
pub struct TorControlPort {
    /// Control port address
    addr: String,
    auth: TorAuth,
    /// Current connection; `None` after a transport failure or an unfinished exchange
    conn: Mutex<Option<BufReader<TcpStream>>>,
}

/// A complete control reply
#[derive(Debug, Clone, Default)]
struct Reply {
    code: u16,
    /// Reply text of every line, data blocks included
    lines: Vec<String>,
}

impl Reply {
    fn is_ok(&self) -> bool {
        self.code == 250
    }

    fn into_result(self) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(CharonError::Control(format!(
                "{} {}",
                self.code,
                self.lines.last().map(String::as_str).unwrap_or_default()
            )))
        }
    }
}

impl TorControlPort {
    /// Connect and authenticate
    pub async fn connect(addr: impl Into<String>, auth: TorAuth) -> Result<Self> {
        let port = Self {
            addr: addr.into(),
            auth,
            conn: Mutex::new(None),
        };
        port.reconnect().await?;
        Ok(port)
    }

    async fn dial(&self) -> Result<BufReader<TcpStream>> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            tracing::debug!(addr = %self.addr, error = %e, "Control port connect failed");
            CharonError::ChannelLost
        })?;
        Ok(BufReader::new(stream))
    }

    async fn auth_line(&self) -> Result<String> {
        match &self.auth {
            TorAuth::None => Ok("AUTHENTICATE".to_string()),
            TorAuth::Password(password) => Ok(format!("AUTHENTICATE {}", quote(password))),
            TorAuth::Cookie(path) => {
                let cookie = tokio::fs::read(path).await.map_err(|e| {
                    CharonError::ConfigInvalid(format!(
                        "cannot read control cookie {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(format!("AUTHENTICATE {}", hex::encode(cookie)))
            }
        }
    }

    /// Send one command and read its reply.
    ///
    /// The connection is taken out for the exchange and only put back once
    /// the reply is fully read. An I/O error or a cancelled exchange leaves
    /// no connection behind, so a late reply can never be read as the answer
    /// to the next command.
    async fn command(&self, line: &str) -> Result<Reply> {
        let mut guard = self.conn.lock().await;
        let Some(mut conn) = guard.take() else {
            return Err(CharonError::ChannelLost);
        };

        match exchange(&mut conn, line).await {
            Ok(reply) => {
                *guard = Some(conn);
                Ok(reply)
            }
            Err(e) => {
                tracing::warn!(addr = %self.addr, error = %e, "Control connection dropped");
                Err(CharonError::ChannelLost)
            }
        }
    }
}

#[async_trait]
impl ControlChannel for TorControlPort {
    async fn authenticate(&self) -> Result<()> {
        let line = self.auth_line().await?;
        self.command(&line).await?.into_result()?;
        Ok(())
    }

    async fn build(&self, hops: &[RelayId]) -> Result<CircuitHandle> {
        let path = hops
            .iter()
            .map(|h| h.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let reply = self
            .command(&format!("EXTENDCIRCUIT 0 {path}"))
            .await?
            .into_result()?;

        let handle = reply
            .lines
            .iter()
            .find_map(|l| parse_extended(l))
            .ok_or_else(|| CharonError::Control("EXTENDCIRCUIT reply without id".to_string()))?;

        tracing::debug!(circuit = %handle, hops = hops.len(), "Tor circuit launched");
        Ok(handle)
    }

    async fn extend(&self, circuit: &CircuitHandle, hop: &RelayId) -> Result<()> {
        self.command(&format!("EXTENDCIRCUIT {} {}", circuit, hop))
            .await?
            .into_result()?;
        Ok(())
    }

    async fn close(&self, circuit: &CircuitHandle) -> Result<()> {
        let reply = self.command(&format!("CLOSECIRCUIT {circuit}")).await?;
        // 552 Unknown circuit: already gone
        if reply.code == 552 {
            return Ok(());
        }
        reply.into_result()?;
        Ok(())
    }

    async fn signal_new_identity(&self) -> Result<()> {
        self.command("SIGNAL NEWNYM").await?.into_result()?;
        Ok(())
    }

    async fn status(&self, circuit: &CircuitHandle) -> Result<RemoteCircuitState> {
        let reply = self
            .command("GETINFO circuit-status")
            .await?
            .into_result()?;
        Ok(parse_circuit_status(&reply.lines, circuit))
    }

    async fn heartbeat(&self) -> Result<()> {
        self.command("GETINFO version").await?.into_result()?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        let mut conn = self.dial().await?;
        let line = self.auth_line().await?;

        let reply = exchange(&mut conn, &line)
            .await
            .map_err(|_| CharonError::ChannelLost)?;
        reply.into_result()?;

        *self.conn.lock().await = Some(conn);
        tracing::info!(addr = %self.addr, "Control port connected and authenticated");
        Ok(())
    }
}

/// Write a command line and read the full reply
async fn exchange(conn: &mut BufReader<TcpStream>, line: &str) -> std::io::Result<Reply> {
    conn.get_mut()
        .write_all(format!("{line}\r\n").as_bytes())
        .await?;

    let mut reply = Reply::default();
    let mut buf = String::new();

    loop {
        buf.clear();
        if conn.read_line(&mut buf).await? == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }

        let (code, sep, text) = parse_reply_line(buf.trim_end_matches(['\r', '\n']))
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidData))?;
        reply.code = code;
        reply.lines.push(text.to_string());

        match sep {
            ' ' => return Ok(reply),
            '+' => {
                // Data block terminated by a lone "."
                loop {
                    buf.clear();
                    if conn.read_line(&mut buf).await? == 0 {
                        return Err(std::io::ErrorKind::UnexpectedEof.into());
                    }
                    let data = buf.trim_end_matches(['\r', '\n']);
                    if data == "." {
                        break;
                    }
                    reply.lines.push(data.strip_prefix('.').unwrap_or(data).to_string());
                }
            }
            _ => {}
        }
    }
}

/// Split `250-text` into (250, '-', "text")
fn parse_reply_line(line: &str) -> Option<(u16, char, &str)> {
    if line.len() < 4 || !line.is_char_boundary(3) {
        return None;
    }
    let code = line[..3].parse().ok()?;
    let sep = line[3..].chars().next()?;
    if !matches!(sep, ' ' | '-' | '+') {
        return None;
    }
    Some((code, sep, &line[4..]))
}

/// Extract the circuit id from `EXTENDED 42`
fn parse_extended(text: &str) -> Option<CircuitHandle> {
    let mut parts = text.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("EXTENDED"), Some(id)) => Some(CircuitHandle(id.to_string())),
        _ => None,
    }
}

/// Find `circuit` in a `GETINFO circuit-status` listing
fn parse_circuit_status(lines: &[String], circuit: &CircuitHandle) -> RemoteCircuitState {
    for line in lines {
        let line = line.strip_prefix("circuit-status=").unwrap_or(line);
        let mut parts = line.split_whitespace();
        if parts.next() != Some(circuit.0.as_str()) {
            continue;
        }
        return match parts.next() {
            Some("LAUNCHED") | Some("GUARD_WAIT") => RemoteCircuitState::Launched,
            Some("EXTENDED") => RemoteCircuitState::Extended,
            Some("BUILT") => RemoteCircuitState::Built,
            Some("FAILED") => RemoteCircuitState::Failed,
            Some("CLOSED") => RemoteCircuitState::Closed,
            _ => RemoteCircuitState::Unknown,
        };
    }

    // Tor drops closed circuits from the listing
    RemoteCircuitState::Closed
}

/// Quote a control protocol string argument
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}
