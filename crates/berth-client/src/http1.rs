//! Minimal HTTP/1.1 codec for talking to a Docker engine socket.
//!
//! A full HTTP client cannot express Docker's connection-hijack convention
//! (a `200 OK` answer followed by raw duplex bytes on the same socket), so
//! the engine leg is driven directly: write a request head, parse the
//! response head, and hand the rest of the socket to the caller with the
//! correct body framing.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::BoxedStream;

const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Headers that describe the connection rather than the payload. These are
/// recomputed on each leg instead of being forwarded.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "upgrade",
    "keep-alive",
    "te",
    "trailer",
    "proxy-authenticate",
    "proxy-authorization",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

#[derive(Debug, Clone, Copy)]
pub enum ConnectionMode<'a> {
    /// Plain request; the response body is delimited by framing or EOF.
    Close,
    /// Declare intent to take over the socket as a raw duplex stream.
    Upgrade(&'a str),
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    method: &str,
    path_and_query: &str,
    authority: &str,
    headers: &[(String, String)],
    body: &[u8],
    mode: ConnectionMode<'_>,
) -> io::Result<()> {
    let mut head = format!("{method} {path_and_query} HTTP/1.1\r\nHost: {authority}\r\n");
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    match mode {
        ConnectionMode::Close => {
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
            head.push_str("Connection: close\r\n");
        }
        ConnectionMode::Upgrade(protocol) => {
            if !body.is_empty() {
                head.push_str(&format!("Content-Length: {}\r\n", body.len()));
            }
            head.push_str("Connection: Upgrade\r\n");
            head.push_str(&format!("Upgrade: {protocol}\r\n"));
        }
    }
    head.push_str("\r\n");

    writer.write_all(head.as_bytes()).await?;
    if !body.is_empty() {
        writer.write_all(body).await?;
    }
    writer.flush().await
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}

/// Reads and parses a response head, returning any body bytes that arrived
/// in the same read.
pub async fn read_response_head<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<(ResponseHead, Vec<u8>)> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response head exceeds limit",
            ));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let leftover = buf.split_off(head_end + 4);
    buf.truncate(head_end);
    let head = parse_head(&buf)?;
    Ok((head, leftover))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(raw: &[u8]) -> io::Result<ResponseHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 response head"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty response head"))?;

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected HTTP version: {version}"),
        ));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed status line"))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed header line: {line}"),
            ));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(ResponseHead {
        status,
        reason,
        headers,
    })
}

#[derive(Debug, Clone, Copy)]
enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    Eof,
}

fn response_body_framing(head: &ResponseHead) -> BodyFraming {
    if head.status == 204 || head.status == 304 || (100..200).contains(&head.status) {
        return BodyFraming::Empty;
    }
    if head.is_chunked() {
        return BodyFraming::Chunked;
    }
    match head.content_length() {
        Some(n) => BodyFraming::Length(n),
        None => BodyFraming::Eof,
    }
}

/// Socket wrapper that serves already-buffered bytes before touching the
/// underlying stream again.
struct BufferedIo {
    leftover: Vec<u8>,
    pos: usize,
    stream: BoxedStream,
}

impl BufferedIo {
    fn new(leftover: Vec<u8>, stream: BoxedStream) -> Self {
        Self {
            leftover,
            pos: 0,
            stream,
        }
    }

    async fn read_some(&mut self, max: usize) -> io::Result<Vec<u8>> {
        if self.pos < self.leftover.len() {
            let end = (self.pos + max).min(self.leftover.len());
            let out = self.leftover[self.pos..end].to_vec();
            self.pos = end;
            return Ok(out);
        }
        let mut buf = vec![0u8; max];
        let n = self.stream.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn read_exact(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let chunk = self.read_some(len - out.len()).await?;
            if chunk.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-body",
                ));
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    async fn read_crlf_line(&mut self) -> io::Result<String> {
        let mut line = Vec::new();
        loop {
            let byte = self.read_exact(1).await?;
            line.push(byte[0]);
            if line.ends_with(b"\r\n") {
                line.truncate(line.len() - 2);
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if line.len() > 1024 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "chunk size line too long",
                ));
            }
        }
    }
}

/// Pull-based response body honoring content-length, chunked and
/// read-to-EOF framing. Chunked framing is decoded here so the relayed
/// payload is always plain bytes the next hop can re-frame.
pub struct BodyReader {
    framing: BodyFraming,
    io: BufferedIo,
    chunk_remaining: u64,
    done: bool,
}

impl BodyReader {
    pub fn new(head: &ResponseHead, leftover: Vec<u8>, stream: BoxedStream) -> Self {
        Self {
            framing: response_body_framing(head),
            io: BufferedIo::new(leftover, stream),
            chunk_remaining: 0,
            done: false,
        }
    }

    /// A HEAD response carries framing headers but no body bytes.
    pub fn empty(stream: BoxedStream) -> Self {
        Self {
            framing: BodyFraming::Empty,
            io: BufferedIo::new(Vec::new(), stream),
            chunk_remaining: 0,
            done: false,
        }
    }

    pub async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        match self.framing {
            BodyFraming::Empty => {
                self.done = true;
                Ok(None)
            }
            BodyFraming::Length(ref mut remaining) => {
                if *remaining == 0 {
                    self.done = true;
                    return Ok(None);
                }
                let want = (*remaining).min(16 * 1024) as usize;
                let chunk = self.io.read_exact(want.min(*remaining as usize)).await?;
                *remaining -= chunk.len() as u64;
                Ok(Some(chunk))
            }
            BodyFraming::Eof => {
                let chunk = self.io.read_some(16 * 1024).await?;
                if chunk.is_empty() {
                    self.done = true;
                    Ok(None)
                } else {
                    Ok(Some(chunk))
                }
            }
            BodyFraming::Chunked => {
                if self.chunk_remaining == 0 {
                    let size_line = self.io.read_crlf_line().await?;
                    let size_text = size_line.split(';').next().unwrap_or_default().trim();
                    let size = u64::from_str_radix(size_text, 16).map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("bad chunk size: {size_text}"),
                        )
                    })?;
                    if size == 0 {
                        // trailer section, terminated by an empty line
                        loop {
                            if self.io.read_crlf_line().await?.is_empty() {
                                break;
                            }
                        }
                        self.done = true;
                        return Ok(None);
                    }
                    self.chunk_remaining = size;
                }
                let want = self.chunk_remaining.min(16 * 1024) as usize;
                let data = self.io.read_exact(want).await?;
                self.chunk_remaining -= data.len() as u64;
                if self.chunk_remaining == 0 {
                    let crlf = self.io.read_exact(2).await?;
                    if crlf != b"\r\n" {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "missing chunk terminator",
                        ));
                    }
                }
                Ok(Some(data))
            }
        }
    }

    pub async fn collect(mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Adapts the pull API into a `Stream` for axum body relays.
    pub fn into_stream(self) -> impl futures::Stream<Item = io::Result<Vec<u8>>> + Send {
        futures::stream::unfold(self, |mut reader| async move {
            match reader.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), reader)),
                Ok(None) => None,
                Err(err) => Some((Err(err), reader)),
            }
        })
    }
}

/// Raw duplex stream that replays bytes the head parser over-read before
/// reading from the socket again. Writes go straight through.
pub struct PrefixedStream {
    prefix: Vec<u8>,
    pos: usize,
    inner: BoxedStream,
}

impl PrefixedStream {
    pub fn new(prefix: Vec<u8>, inner: BoxedStream) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            self.pos += take;
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(stream: tokio::io::DuplexStream) -> BoxedStream {
        Box::new(stream)
    }

    #[tokio::test]
    async fn parses_head_and_length_body() {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });
        let mut client = boxed(client);
        let (head, leftover) = read_response_head(&mut client).await.expect("head");
        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.header("content-type"), Some("application/json"));
        let body = BodyReader::new(&head, leftover, client)
            .collect()
            .await
            .expect("body");
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn decodes_chunked_body_split_across_reads() {
        let (client, mut server) = tokio::io::duplex(16);
        tokio::spawn(async move {
            let payload =
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n";
            for piece in payload.chunks(7) {
                server.write_all(piece).await.unwrap();
            }
        });
        let mut client = boxed(client);
        let (head, leftover) = read_response_head(&mut client).await.expect("head");
        let body = BodyReader::new(&head, leftover, client)
            .collect()
            .await
            .expect("body");
        assert_eq!(body, b"wikipedia");
    }

    #[tokio::test]
    async fn reads_to_eof_without_framing_headers() {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server
                .write_all(b"HTTP/1.1 200 OK\r\n\r\nstream until close")
                .await
                .unwrap();
            drop(server);
        });
        let mut client = boxed(client);
        let (head, leftover) = read_response_head(&mut client).await.expect("head");
        let body = BodyReader::new(&head, leftover, client)
            .collect()
            .await
            .expect("body");
        assert_eq!(body, b"stream until close");
    }

    #[tokio::test]
    async fn request_writer_recomputes_hop_by_hop_headers() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let headers = vec![
            ("Content-Length".to_string(), "999".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("X-Custom".to_string(), "kept".to_string()),
        ];
        write_request(
            &mut client,
            "POST",
            "/v1.41/containers/create?name=web",
            "localhost",
            &headers,
            b"{}",
            ConnectionMode::Close,
        )
        .await
        .expect("write");
        drop(client);

        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("POST /v1.41/containers/create?name=web HTTP/1.1\r\n"));
        assert!(text.contains("X-Custom: kept\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(!text.contains("999"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n{}"));
    }

    #[tokio::test]
    async fn prefixed_stream_replays_overread_bytes_first() {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server.write_all(b" world").await.unwrap();
            drop(server);
        });
        let mut stream = PrefixedStream::new(b"hello".to_vec(), boxed(client));
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }
}
