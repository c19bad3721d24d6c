use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::http::{fixed_response, read_request_head, read_response_head, HeadError, RequestHead};
use super::rules::FaultBehavior;
use super::{lock, RecordedRequest, Shared};

/// Buffer size for relaying bodies.
const RELAY_BUF_SIZE: usize = 8192;

/// Handle one accepted connection until it finishes or the fixture stops.
///
/// Each connection carries exactly one request. Forwarded requests and
/// their responses are marked `Connection: close`, so a pooling client
/// opens a fresh connection for every request and none can skip the rules.
pub(crate) async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    shared.stats.connection_opened();

    tokio::select! {
        _ = shutdown.cancelled() => {
            debug!("Fixture stopping, closing connection from {}", peer);
        }
        result = serve(&mut client, peer, &shared) => {
            if let Err(e) = result {
                debug!("Connection from {} ended with error: {}", peer, e);
            }
        }
    }

    shared.stats.connection_closed();
}

async fn serve(client: &mut TcpStream, peer: SocketAddr, shared: &Shared) -> std::io::Result<()> {
    let config = &shared.config;

    let read = tokio::time::timeout(
        config.head_read_timeout(),
        read_request_head(client, config.max_head_bytes),
    )
    .await;

    let (head, early) = match read {
        Ok(Ok(parsed)) => parsed,
        Ok(Err(HeadError::Io(e))) => return Err(e),
        Ok(Err(e @ HeadError::Closed { .. })) => {
            debug!("Connection from {}: {}", peer, e);
            return Ok(());
        }
        Ok(Err(e @ HeadError::TooLarge)) => {
            warn!("Connection from {}: {}", peer, e);
            return reply_and_close(client, 431).await;
        }
        Ok(Err(e @ HeadError::Malformed(_))) => {
            warn!("Connection from {}: {}", peer, e);
            return reply_and_close(client, 400).await;
        }
        Err(_) => {
            debug!(
                "Connection from {}: no request head within {:?}",
                peer,
                config.head_read_timeout()
            );
            return reply_and_close(client, 408).await;
        }
    };

    let behavior = lock(&shared.rules)
        .select(&head.method, &head.target)
        .unwrap_or(FaultBehavior::PassThrough);

    info!(
        "{} {} from {} -> {}",
        head.method,
        head.target,
        peer,
        behavior.label()
    );
    shared.stats.record_behavior(&behavior);
    lock(&shared.journal).push(RecordedRequest {
        method: head.method.clone(),
        target: head.target.clone(),
        host: head.header("host").map(str::to_string),
        peer,
        behavior: behavior.clone(),
    });

    match behavior {
        FaultBehavior::PassThrough => forward(client, &head, early, shared).await,
        FaultBehavior::DropConnection => {
            // Zero linger turns the close into an RST with no HTTP framing.
            let socket = socket2::SockRef::from(&*client);
            socket.set_linger(Some(Duration::ZERO))?;
            Ok(())
        }
        FaultBehavior::Delay { delay_ms } => {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            forward(client, &head, early, shared).await
        }
        FaultBehavior::FixedStatus { status } => reply_and_close(client, status).await,
    }
}

/// Relay the request to the target and its response back to the client,
/// then close both connections.
async fn forward(
    client: &mut TcpStream,
    head: &RequestHead,
    early: Vec<u8>,
    shared: &Shared,
) -> std::io::Result<()> {
    let config = &shared.config;
    let target = config.target_addr();

    let connect = tokio::time::timeout(
        config.upstream_connect_timeout(),
        TcpStream::connect(&target),
    )
    .await;
    let mut upstream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("Failed to connect to target {}: {}", target, e);
            return reply_and_close(client, 502).await;
        }
        Err(_) => {
            warn!(
                "Timed out connecting to target {} after {:?}",
                target,
                config.upstream_connect_timeout()
            );
            return reply_and_close(client, 504).await;
        }
    };

    let mut outgoing = head.clone();
    if config.rewrite_host_header {
        outgoing.set_header("Host", &config.target_authority());
    }
    // Upgrades keep their `Connection: Upgrade` and become a raw tunnel.
    if outgoing.header("upgrade").is_none() {
        outgoing.set_header("Connection", "close");
        outgoing.remove_header("Keep-Alive");
    }
    outgoing.remove_header("Proxy-Connection");

    let encoded = outgoing.encode();
    shared
        .stats
        .add_bytes((encoded.len() + early.len()) as u64, 0);
    upstream.write_all(&encoded).await?;
    if !early.is_empty() {
        upstream.write_all(&early).await?;
    }

    let (mut client_rd, mut client_wr) = client.split();
    let (mut upstream_rd, mut upstream_wr) = upstream.split();

    let upload = pump(&mut client_rd, &mut upstream_wr, |n| {
        shared.stats.add_bytes(n, 0)
    });
    let download = relay_response(&mut upstream_rd, &mut client_wr, shared);
    tokio::pin!(upload);
    tokio::pin!(download);

    // The response decides when the exchange is over; a client that stops
    // sending early only half-closes the upstream side.
    let mut upload_done = false;
    loop {
        tokio::select! {
            result = &mut upload, if !upload_done => {
                upload_done = true;
                result?;
            }
            result = &mut download => {
                result?;
                break;
            }
        }
    }

    debug!("Relay to {} finished", target);
    Ok(())
}

/// Copy the target's response to the client. Interim 1xx heads pass
/// through untouched; the final head gets `Connection: close`.
async fn relay_response<R, W>(
    upstream: &mut R,
    client: &mut W,
    shared: &Shared,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let max = shared.config.max_head_bytes;
    let mut buffered = Vec::new();
    loop {
        let read = read_response_head(upstream, buffered, max).await;
        let (mut head, rest) = match read {
            Ok(parsed) => parsed,
            Err(HeadError::Io(e)) => return Err(e),
            Err(e) => {
                warn!(
                    "Bad response from target {}: {}",
                    shared.config.target_addr(),
                    e
                );
                return reply_and_close(client, 502).await;
            }
        };

        if head.is_interim() {
            let encoded = head.encode();
            shared.stats.add_bytes(0, encoded.len() as u64);
            client.write_all(&encoded).await?;
            buffered = rest;
            continue;
        }

        if head.status != 101 {
            head.set_header("Connection", "close");
            head.remove_header("Keep-Alive");
        }
        let encoded = head.encode();
        shared
            .stats
            .add_bytes(0, (encoded.len() + rest.len()) as u64);
        client.write_all(&encoded).await?;
        if !rest.is_empty() {
            client.write_all(&rest).await?;
        }
        break;
    }

    pump(upstream, client, |n| shared.stats.add_bytes(0, n)).await
}

/// Copy `reader` to `writer` until EOF, reporting each chunk to `on_bytes`
/// before it is written, then shut `writer` down.
async fn pump<R, W, F>(reader: &mut R, writer: &mut W, on_bytes: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return writer.shutdown().await;
        }
        on_bytes(n as u64);
        writer.write_all(&buf[..n]).await?;
    }
}

async fn reply_and_close<W>(writer: &mut W, status: u16) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&fixed_response(status)).await?;
    writer.shutdown().await
}
