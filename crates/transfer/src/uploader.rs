//! Ranged PUT against a pre-signed URL.

use std::future::Future;
use std::io::SeekFrom;
use std::pin::Pin;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::TransferError;
use crate::source::FileSource;
use crate::strategy::ByteRange;

/// Size of each body chunk streamed to the store; progress is reported at
/// this granularity.
const STREAM_CHUNK: usize = 64 * 1024;

/// Upper bound on a single part PUT.
const PUT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// One PUT of a byte range.
pub struct PutRequest<'a> {
    pub url: &'a str,
    pub source: &'a FileSource,
    pub range: ByteRange,
    pub content_type: &'a str,
    /// Called with the cumulative number of bytes of `range` sent so far.
    pub on_progress: &'a (dyn Fn(u64) + Send + Sync),
    pub cancel: &'a CancellationToken,
}

/// Boxed future returned by [`PartUploader::put_range`]; resolves to the ETag.
pub type PutFuture<'a> = Pin<Box<dyn Future<Output = Result<String, TransferError>> + Send + 'a>>;

/// Moves one byte range of a file to a pre-signed URL.
pub trait PartUploader: Send + Sync {
    fn put_range<'a>(&'a self, req: PutRequest<'a>) -> PutFuture<'a>;
}

/// [`PartUploader`] over `reqwest`, streaming the range from disk.
#[derive(Clone)]
pub struct HttpPartUploader {
    http: reqwest::Client,
}

impl HttpPartUploader {
    pub fn new() -> Result<Self, TransferError> {
        let http = reqwest::Client::builder().timeout(PUT_TIMEOUT).build()?;
        Ok(Self { http })
    }

    async fn put(&self, req: PutRequest<'_>) -> Result<String, TransferError> {
        if req.cancel.is_cancelled() {
            return Err(TransferError::Canceled);
        }

        let len = req.range.len();
        let mut file = tokio::fs::File::open(&req.source.path).await?;
        let on_disk = file.metadata().await?.len();
        if on_disk < req.range.end {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "{} is {on_disk} bytes, range ends at {}",
                    req.source.path.display(),
                    req.range.end
                ),
            )
            .into());
        }
        file.seek(SeekFrom::Start(req.range.start)).await?;

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let mut sent = 0u64;
        let stream = ReaderStream::with_capacity(file.take(len), STREAM_CHUNK).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                let _ = progress_tx.send(sent);
            }
            chunk
        });

        let send = self
            .http
            .put(req.url)
            .header(CONTENT_LENGTH, len)
            .header(CONTENT_TYPE, req.content_type)
            .body(reqwest::Body::wrap_stream(stream))
            .send();
        tokio::pin!(send);

        let resp = loop {
            tokio::select! {
                biased;
                _ = req.cancel.cancelled() => {
                    debug!(start = req.range.start, end = req.range.end, "part upload canceled");
                    return Err(TransferError::Canceled);
                }
                Some(bytes) = progress_rx.recv() => (req.on_progress)(bytes),
                resp = &mut send => break resp?,
            }
        };
        while let Ok(bytes) = progress_rx.try_recv() {
            (req.on_progress)(bytes);
        }

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransferError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        resp.headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or(TransferError::MissingETag)
    }
}

impl PartUploader for HttpPartUploader {
    fn put_range<'a>(&'a self, req: PutRequest<'a>) -> PutFuture<'a> {
        Box::pin(self.put(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    struct Captured {
        head: String,
        body: Vec<u8>,
    }

    async fn read_request(stream: &mut TcpStream) -> Captured {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        let head_end = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break buf.len();
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
        let len = head
            .lines()
            .filter_map(|l| l.split_once(':'))
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < head_end + len {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        Captured {
            head,
            body: buf[head_end..].to_vec(),
        }
    }

    /// One-shot store that records the PUT and answers with `response`.
    async fn store_server(
        response: &'static str,
    ) -> (String, tokio::task::JoinHandle<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/bucket/object?X-Sig=abc", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let captured = read_request(&mut stream).await;
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
            captured
        });
        (url, handle)
    }

    fn source_file(dir: &tempfile::TempDir, len: usize) -> FileSource {
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        FileSource {
            path,
            size: len as u64,
            last_modified: 1,
            name: "data.bin".into(),
            content_type: "application/octet-stream".into(),
        }
    }

    #[tokio::test]
    async fn put_sends_exact_range_and_returns_etag() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(&dir, 300_000);
        let (url, server) = store_server(
            "HTTP/1.1 200 OK\r\nETag: \"part-etag\"\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let uploader = HttpPartUploader::new().unwrap();
        let cancel = CancellationToken::new();
        let reported = Mutex::new(Vec::new());
        let on_progress = |n: u64| reported.lock().unwrap().push(n);
        let range = ByteRange::new(100_000, 250_000);

        let etag = uploader
            .put_range(PutRequest {
                url: &url,
                source: &source,
                range,
                content_type: "application/octet-stream",
                on_progress: &on_progress,
                cancel: &cancel,
            })
            .await
            .unwrap();
        assert_eq!(etag, "\"part-etag\"");

        let captured = server.await.unwrap();
        assert!(captured.head.starts_with("PUT /bucket/object?X-Sig=abc "));
        assert!(captured.head.to_ascii_lowercase().contains("content-length: 150000"));
        let expected: Vec<u8> = (100_000..250_000).map(|i| (i % 251) as u8).collect();
        assert_eq!(captured.body, expected);

        let reported = reported.lock().unwrap();
        assert!(!reported.is_empty());
        assert!(reported.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*reported.last().unwrap(), 150_000);
    }

    #[tokio::test]
    async fn missing_etag_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(&dir, 1000);
        let (url, server) =
            store_server("HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;

        let uploader = HttpPartUploader::new().unwrap();
        let cancel = CancellationToken::new();
        let err = uploader
            .put_range(PutRequest {
                url: &url,
                source: &source,
                range: source.full_range(),
                content_type: "application/octet-stream",
                on_progress: &|_| {},
                cancel: &cancel,
            })
            .await
            .unwrap_err();
        server.await.unwrap();
        assert!(matches!(err, TransferError::MissingETag));
    }

    #[tokio::test]
    async fn store_rejection_carries_status() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(&dir, 1000);
        let (url, server) = store_server(
            "HTTP/1.1 403 Forbidden\r\nContent-Length: 7\r\nConnection: close\r\n\r\nexpired",
        )
        .await;

        let uploader = HttpPartUploader::new().unwrap();
        let cancel = CancellationToken::new();
        let err = uploader
            .put_range(PutRequest {
                url: &url,
                source: &source,
                range: source.full_range(),
                content_type: "application/octet-stream",
                on_progress: &|_| {},
                cancel: &cancel,
            })
            .await
            .unwrap_err();
        server.await.unwrap();
        match err {
            TransferError::Rejected { status, body } => {
                assert_eq!(status, 403);
                assert_eq!(body, "expired");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn canceled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(&dir, 10);
        let uploader = HttpPartUploader::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = uploader
            .put_range(PutRequest {
                url: "http://127.0.0.1:9/never",
                source: &source,
                range: source.full_range(),
                content_type: "application/octet-stream",
                on_progress: &|_| {},
                cancel: &cancel,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Canceled));
    }

    #[tokio::test]
    async fn canceled_while_waiting_for_store() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(&dir, 1000);

        // Store reads the request but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/slow", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut stream).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let uploader = HttpPartUploader::new().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = uploader
            .put_range(PutRequest {
                url: &url,
                source: &source,
                range: source.full_range(),
                content_type: "application/octet-stream",
                on_progress: &|_| {},
                cancel: &cancel,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Canceled));
        server.abort();
    }

    #[tokio::test]
    async fn range_past_end_of_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(&dir, 100);
        let uploader = HttpPartUploader::new().unwrap();
        let cancel = CancellationToken::new();

        let err = uploader
            .put_range(PutRequest {
                url: "http://127.0.0.1:9/never",
                source: &source,
                range: ByteRange::new(50, 200),
                content_type: "application/octet-stream",
                on_progress: &|_| {},
                cancel: &cancel,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }
}
