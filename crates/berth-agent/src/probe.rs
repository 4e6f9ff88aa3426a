use std::time::Duration;

use anyhow::Context as _;
use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::TcpStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of a connectivity probe against a Redis endpoint. Password
/// refusals are split out so the detector can log them distinctly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingOutcome {
    Pong,
    AuthRequired(String),
    Failed(String),
}

impl PingOutcome {
    pub fn is_pong(&self) -> bool {
        matches!(self, Self::Pong)
    }
}

/// Server facts pulled from `INFO server`, used for the default entry's
/// status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: String,
    pub uptime_secs: u64,
}

fn encode_command(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

async fn connect(host: &str, port: u16) -> anyhow::Result<BufReader<TcpStream>> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| anyhow::anyhow!("connect timed out"))?
        .with_context(|| format!("connect {host}:{port}"))?;
    Ok(BufReader::new(stream))
}

async fn send_command(conn: &mut BufReader<TcpStream>, args: &[&str]) -> anyhow::Result<()> {
    let payload = encode_command(args);
    tokio::time::timeout(IO_TIMEOUT, conn.get_mut().write_all(&payload))
        .await
        .map_err(|_| anyhow::anyhow!("write timed out"))?
        .context("write command")?;
    Ok(())
}

async fn read_reply_line(conn: &mut BufReader<TcpStream>) -> anyhow::Result<String> {
    let mut line = String::new();
    let n = tokio::time::timeout(IO_TIMEOUT, conn.read_line(&mut line))
        .await
        .map_err(|_| anyhow::anyhow!("read timed out"))?
        .context("read reply")?;
    if n == 0 {
        anyhow::bail!("connection closed");
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn auth_refused(reply: &str) -> bool {
    reply.starts_with("-NOAUTH") || reply.starts_with("-ERR invalid password")
        || reply.starts_with("-WRONGPASS")
}

async fn authenticate(
    conn: &mut BufReader<TcpStream>,
    password: Option<&str>,
) -> anyhow::Result<Option<PingOutcome>> {
    let Some(pass) = password.filter(|p| !p.is_empty()) else {
        return Ok(None);
    };
    send_command(conn, &["AUTH", pass]).await?;
    let reply = read_reply_line(conn).await?;
    if auth_refused(&reply) {
        return Ok(Some(PingOutcome::AuthRequired(reply)));
    }
    if reply.starts_with('-') {
        return Ok(Some(PingOutcome::Failed(reply)));
    }
    Ok(None)
}

/// Single PING round-trip, authenticating first when a password is set.
pub async fn ping(host: &str, port: u16, password: Option<&str>) -> PingOutcome {
    match ping_inner(host, port, password).await {
        Ok(outcome) => outcome,
        Err(e) => PingOutcome::Failed(crate::error::format_error_chain(&e)),
    }
}

async fn ping_inner(
    host: &str,
    port: u16,
    password: Option<&str>,
) -> anyhow::Result<PingOutcome> {
    let mut conn = connect(host, port).await?;
    if let Some(outcome) = authenticate(&mut conn, password).await? {
        return Ok(outcome);
    }
    send_command(&mut conn, &["PING"]).await?;
    let reply = read_reply_line(&mut conn).await?;
    if reply == "+PONG" {
        return Ok(PingOutcome::Pong);
    }
    if auth_refused(&reply) {
        return Ok(PingOutcome::AuthRequired(reply));
    }
    Ok(PingOutcome::Failed(format!("unexpected reply: {reply}")))
}

/// Fetch `INFO server` and extract version/uptime.
pub async fn server_info(
    host: &str,
    port: u16,
    password: Option<&str>,
) -> anyhow::Result<ServerInfo> {
    let mut conn = connect(host, port).await?;
    if let Some(outcome) = authenticate(&mut conn, password).await? {
        anyhow::bail!("auth failed: {outcome:?}");
    }
    send_command(&mut conn, &["INFO", "server"]).await?;

    let header = read_reply_line(&mut conn).await?;
    let len: usize = header
        .strip_prefix('$')
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("unexpected INFO reply: {header}"))?;

    let mut payload = vec![0u8; len + 2]; // body + trailing CRLF
    tokio::time::timeout(IO_TIMEOUT, conn.read_exact(&mut payload))
        .await
        .map_err(|_| anyhow::anyhow!("read timed out"))?
        .context("read INFO body")?;
    let text = String::from_utf8_lossy(&payload);

    parse_server_info(&text).ok_or_else(|| anyhow::anyhow!("INFO reply missing server fields"))
}

fn parse_server_info(payload: &str) -> Option<ServerInfo> {
    let mut version = None;
    let mut uptime = None;
    for line in payload.lines() {
        if let Some(v) = line.trim().strip_prefix("redis_version:") {
            version = Some(v.trim().to_string());
        } else if let Some(v) = line.trim().strip_prefix("uptime_in_seconds:") {
            uptime = v.trim().parse::<u64>().ok();
        }
    }
    Some(ServerInfo {
        version: version?,
        uptime_secs: uptime?,
    })
}

/// Best-effort shutdown of an externally managed server. A successful
/// SHUTDOWN closes the connection without a reply; any error reply is a
/// refusal (the server may be under another supervisor's control).
pub async fn shutdown(host: &str, port: u16, password: Option<&str>) -> anyhow::Result<()> {
    let mut conn = connect(host, port).await?;
    if let Some(outcome) = authenticate(&mut conn, password).await? {
        anyhow::bail!("auth failed: {outcome:?}");
    }
    send_command(&mut conn, &["SHUTDOWN", "NOSAVE"]).await?;
    match read_reply_line(&mut conn).await {
        // Connection closed without a reply is the success path.
        Err(_) => Ok(()),
        Ok(reply) if reply.starts_with('-') => anyhow::bail!("shutdown refused: {reply}"),
        Ok(_) => Ok(()),
    }
}

/// `redis-server --version` output looks like:
/// `Redis server v=7.2.4 sha=00000000:0 malloc=jemalloc-5.3.0 bits=64 build=...`
pub(crate) fn parse_redis_server_version(line: &str) -> Option<String> {
    line.split_whitespace()
        .find_map(|tok| tok.strip_prefix("v="))
        .map(|v| v.to_string())
}

/// Probe the native binary. Used by the API layer to gate UI affordances.
pub async fn redis_server_installed() -> (bool, Option<String>) {
    redis_server_installed_at("redis-server").await
}

pub(crate) async fn redis_server_installed_at(binary: &str) -> (bool, Option<String>) {
    let out = tokio::process::Command::new(binary)
        .arg("--version")
        .output()
        .await;
    match out {
        Ok(o) if o.status.success() => {
            let text = String::from_utf8_lossy(&o.stdout);
            let version = text.lines().next().and_then(parse_redis_server_version);
            (true, version)
        }
        _ => (false, None),
    }
}
