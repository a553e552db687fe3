use std::{process::Stdio, time::Duration};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tcp_relay::{codec::RelayCodec, Framing};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpStream,
    process::{ChildStdout, Command},
    time::timeout,
};
use tokio_util::codec::Framed;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn binary_relays_and_logs_disconnects() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("tcp-relay");

    let mut child = Command::new(binary)
        .arg("--listen")
        .arg("127.0.0.1:0")
        .env("RUST_LOG", "info")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn relay")?;
    let stdout = child.stdout.take().context("relay stdout missing")?;
    let mut logs = BufReader::new(stdout);

    let addr = read_relay_addr(&mut logs).await?;

    let mut alice = connect(&addr).await?;
    let mut bob = connect(&addr).await?;
    wait_for_log(&mut logs, |line| line.contains("peer connected") && line.contains("peer=2")).await?;

    alice.send(Bytes::from("hello bob")).await?;
    let heard = timeout(READ_TIMEOUT, bob.next())
        .await
        .context("bob timed out")?
        .context("bob's connection closed")??;
    assert_eq!(heard, "hello bob");

    alice.send(Bytes::from(".")).await?;
    let line = wait_for_log(&mut logs, |line| line.contains("peer disconnected")).await?;
    assert!(line.contains("peer=1"), "disconnect should name alice: {line}");
    assert!(line.contains("reason=sentinel"), "unexpected reason: {line}");

    child.kill().await?;
    Ok(())
}

async fn connect(addr: &str) -> Result<Framed<TcpStream, RelayCodec>> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    Ok(Framed::new(stream, RelayCodec::new(Framing::LengthPrefixed, 255)))
}

async fn read_relay_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let line = read_line(reader)
        .await?
        .context("relay did not emit listening address")?;
    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected relay banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("relay banner missing socket: {trimmed}"));
    }
    Ok(addr.to_string())
}

async fn wait_for_log<P>(reader: &mut BufReader<ChildStdout>, predicate: P) -> Result<String>
where
    P: Fn(&str) -> bool,
{
    loop {
        match read_line(reader).await? {
            Some(line) if predicate(&line) => return Ok(line),
            Some(_) => continue,
            None => return Err(anyhow!("relay output ended")),
        }
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let bytes = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(result) => result?,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}
