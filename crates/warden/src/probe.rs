//! Probe transport through the daemon's SOCKS port.
//!
//! Each circuit is addressed through SOCKS5 username/password isolation:
//! the identity token is used as both, so the daemon attaches the probe
//! stream to the slot's circuit. The probe itself is a plain HTTP/1.0 GET
//! of the reference document.

use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::config::ProbeConfig;
use crate::health::{ProbeSample, ProbeTarget, Prober};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_USER_PASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;

/// Largest reference body accepted
const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

/// Fetches the reference document over the daemon's SOCKS port
pub struct SocksProber {
    socks_addr: String,
    reference: ProbeConfig,
}

impl SocksProber {
    pub fn new(socks_addr: impl Into<String>, reference: ProbeConfig) -> Self {
        Self {
            socks_addr: socks_addr.into(),
            reference,
        }
    }
}

#[async_trait]
impl Prober for SocksProber {
    async fn probe(&self, target: &ProbeTarget) -> Result<ProbeSample> {
        let mut stream = TcpStream::connect(&self.socks_addr)
            .await
            .with_context(|| format!("SOCKS port {} unreachable", self.socks_addr))?;

        let isolation = target.identity.to_string();
        socks_connect(
            &mut stream,
            &isolation,
            &self.reference.reference_host,
            self.reference.reference_port,
        )
        .await?;

        let request = format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\nUser-Agent: Mozilla/5.0\r\n\r\n",
            self.reference.reference_path, self.reference.reference_host
        );
        let started = Instant::now();
        stream.write_all(request.as_bytes()).await?;

        let (response, latency) = read_response(&mut stream, started).await?;
        let elapsed = started.elapsed();
        let payload = http_body(&response)?.to_vec();

        Ok(ProbeSample {
            latency,
            throughput_bps: throughput(response.len(), elapsed),
            payload,
        })
    }
}

/// SOCKS5 handshake with username/password isolation, then CONNECT host:port
pub async fn socks_connect<S>(stream: &mut S, isolation: &str, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ensure!(
        !isolation.is_empty() && isolation.len() <= 255,
        "isolation token must be 1-255 bytes"
    );
    ensure!(!host.is_empty() && host.len() <= 255, "host must be 1-255 bytes");

    stream.write_all(&[SOCKS_VERSION, 1, AUTH_USER_PASS]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [SOCKS_VERSION, AUTH_USER_PASS] {
        bail!("SOCKS server refused username/password auth");
    }

    let mut auth = vec![0x01, isolation.len() as u8];
    auth.extend_from_slice(isolation.as_bytes());
    auth.push(isolation.len() as u8);
    auth.extend_from_slice(isolation.as_bytes());
    stream.write_all(&auth).await?;
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        bail!("SOCKS auth rejected (status {})", reply[1]);
    }

    let mut connect = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host.len() as u8];
    connect.extend_from_slice(host.as_bytes());
    connect.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&connect).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        bail!("SOCKS connect failed (reply {})", head[1]);
    }

    // Skip the bound address
    let skip = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => stream.read_u8().await? as usize,
        other => bail!("unknown SOCKS address type {other}"),
    };
    let mut bound = vec![0u8; skip + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

/// Read until EOF; returns the bytes and the time to the first byte
async fn read_response<S>(stream: &mut S, started: Instant) -> Result<(Vec<u8>, Duration)>
where
    S: AsyncRead + Unpin,
{
    let mut response = Vec::new();
    let mut first_byte = None;
    let mut buf = [0u8; 8192];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        first_byte.get_or_insert_with(|| started.elapsed());
        response.extend_from_slice(&buf[..n]);
        ensure!(response.len() <= MAX_RESPONSE_BYTES, "reference response too large");
    }

    let latency = first_byte.context("empty response")?;
    Ok((response, latency))
}

/// Body of a complete HTTP response; non-2xx statuses are errors
fn http_body(response: &[u8]) -> Result<&[u8]> {
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .context("malformed HTTP response")?;

    let head = String::from_utf8_lossy(&response[..split]);
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .context("missing HTTP status")?;
    ensure!((200..300).contains(&status), "reference fetch returned HTTP {status}");

    Ok(&response[split + 4..])
}

fn throughput(bytes: usize, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return bytes as u64;
    }
    (bytes as f64 / secs) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_body() {
        let response = b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(http_body(response).unwrap(), b"hello");

        assert!(http_body(b"HTTP/1.0 503 Busy\r\n\r\nno").is_err());
        assert!(http_body(b"garbage").is_err());
    }

    #[test]
    fn test_throughput() {
        assert_eq!(throughput(10_000, Duration::from_secs(2)), 5_000);
        assert_eq!(throughput(10, Duration::ZERO), 10);
    }

    #[tokio::test]
    async fn test_socks_handshake() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let daemon = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x02]);
            server.write_all(&[0x05, 0x02]).await.unwrap();

            let mut head = [0u8; 2];
            server.read_exact(&mut head).await.unwrap();
            let mut user = vec![0u8; head[1] as usize];
            server.read_exact(&mut user).await.unwrap();
            let len = server.read_u8().await.unwrap();
            let mut pass = vec![0u8; len as usize];
            server.read_exact(&mut pass).await.unwrap();
            server.write_all(&[0x01, 0x00]).await.unwrap();

            let mut connect = [0u8; 5];
            server.read_exact(&mut connect).await.unwrap();
            let mut host = vec![0u8; connect[4] as usize];
            server.read_exact(&mut host).await.unwrap();
            let port = server.read_u16().await.unwrap();
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
                .await
                .unwrap();

            (String::from_utf8(user).unwrap(), pass, String::from_utf8(host).unwrap(), port)
        });

        socks_connect(&mut client, "9f86d081884c7d65", "example.org", 80)
            .await
            .unwrap();
        let (user, pass, host, port) = daemon.await.unwrap();

        assert_eq!(user, "9f86d081884c7d65");
        assert_eq!(pass, user.as_bytes());
        assert_eq!(host, "example.org");
        assert_eq!(port, 80);
    }

    #[tokio::test]
    async fn test_socks_auth_refused() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0xFF]).await.unwrap();
        });

        let err = socks_connect(&mut client, "id", "example.org", 80).await.unwrap_err();
        assert!(err.to_string().contains("refused"));
    }
}
