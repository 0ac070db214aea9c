//! Object storage access for restores, built on `aws-sdk-s3` with path style addressing.

use crate::config::S3Destination;
use crate::error::{ResticError, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client,
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio_util::sync::CancellationToken;

/// Size of a single upload part.
pub const PART_SIZE: usize = 8 * 1024 * 1024;
const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: i64,
}

pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;
pub type UploadBody = Box<dyn AsyncRead + Send + Unpin>;

/// A bucket that restores are streamed into.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Stores everything `body` yields under `key` and returns the number of bytes.
    /// Nothing is stored when `body` fails.
    async fn put(&self, key: &str, body: UploadBody) -> Result<u64>;

    async fn get(&self, key: &str) -> Result<ObjectReader>;

    async fn list(&self) -> Result<Vec<ObjectInfo>>;

    /// Removes every object of the bucket and then the bucket itself.
    async fn delete_bucket(&self) -> Result<()>;
}

fn storage_error<E>(op: &str, err: E) -> ResticError
where
    E: std::error::Error,
{
    ResticError::ObjectStorage(format!("{op}: {}", DisplayErrorContext(err)))
}

/// Splits `http(s)://host[:port]/bucket[/...]` into the endpoint and the bucket.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, String)> {
    let url = reqwest::Url::parse(endpoint).map_err(|e| {
        ResticError::ObjectStorage(format!("error parsing S3 Endpoint URL '{endpoint}': {e}"))
    })?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ResticError::ObjectStorage(format!(
                "endpoint '{endpoint}' has wrong scheme '{other}' (should be 'http' or 'https')"
            )));
        }
    }
    let host = url.host_str().ok_or_else(|| {
        ResticError::ObjectStorage(format!("endpoint '{endpoint}' has no host"))
    })?;
    let base = match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    };
    let bucket = url
        .path_segments()
        .and_then(|mut segments| segments.find(|s| !s.is_empty()))
        .map(str::to_string)
        .ok_or_else(|| {
            ResticError::ObjectStorage(format!("endpoint '{endpoint}' doesn't name a bucket"))
        })?;
    Ok((base, bucket))
}

pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Connects to the destination and creates its bucket if it doesn't exist yet.
    pub async fn connect(dest: &S3Destination) -> Result<Self> {
        let (endpoint, bucket) = parse_endpoint(&dest.endpoint)?;
        let credentials = Credentials::new(
            dest.access_key.clone(),
            dest.secret_key.clone(),
            None,
            None,
            "wrestic",
        );
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(DEFAULT_REGION))
            .endpoint_url(&endpoint)
            .credentials_provider(credentials)
            .load()
            .await;
        let conf = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();

        let client = Self {
            client: Client::from_conf(conf),
            bucket,
        };
        client.ensure_bucket().await?;
        Ok(client)
    }

    async fn ensure_bucket(&self) -> Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(e) => {
                tracing::debug!(bucket = %self.bucket, "bucket lookup failed, creating it: {}", DisplayErrorContext(&e));
            }
        }
        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                tracing::info!(bucket = %self.bucket, "created bucket");
                Ok(())
            }
            Err(e)
                if e.as_service_error().is_some_and(|se| {
                    se.is_bucket_already_owned_by_you() || se.is_bucket_already_exists()
                }) =>
            {
                Ok(())
            }
            Err(e) => Err(storage_error("create bucket", e)),
        }
    }

    /// Uploads everything `reader` yields under `key` and returns the number of bytes.
    ///
    /// Streams that fit into one part are sent with a single request, anything larger goes
    /// through a multipart upload which is aborted when a part fails.
    pub async fn upload<R>(&self, key: &str, mut reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let first = read_part(&mut reader).await?;
        if first.len() < PART_SIZE {
            let size = first.len() as u64;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(first))
                .send()
                .await
                .map_err(|e| storage_error("put object", e))?;
            tracing::info!(bucket = %self.bucket, key, size, "uploaded object");
            return Ok(size);
        }

        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_error("create multipart upload", e))?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| ResticError::ObjectStorage("multipart upload without id".into()))?
            .to_string();

        match self.upload_parts(key, &upload_id, first, &mut reader).await {
            Ok(size) => {
                tracing::info!(bucket = %self.bucket, key, size, "uploaded object");
                Ok(size)
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::error!(key, "aborting the upload failed: {}", DisplayErrorContext(&abort));
                }
                Err(e)
            }
        }
    }

    async fn upload_parts<R>(
        &self,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        reader: &mut R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut parts = Vec::new();
        let mut part = first;
        let mut part_number = 1;
        let mut total = 0u64;

        while !part.is_empty() {
            total += part.len() as u64;
            let resp = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(|e| storage_error("upload part", e))?;
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(resp.e_tag().map(str::to_string))
                    .build(),
            );
            part_number += 1;
            part = read_part(reader).await?;
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| storage_error("complete multipart upload", e))?;
        Ok(total)
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &str, body: UploadBody) -> Result<u64> {
        self.upload(key, body).await
    }

    async fn get(&self, key: &str) -> Result<ObjectReader> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_error("get object", e))?;
        Ok(Box::pin(resp.body.into_async_read()))
    }

    async fn list(&self) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| storage_error("list objects", e))?;
            objects.extend(resp.contents().iter().map(|o| ObjectInfo {
                key: o.key().unwrap_or_default().to_string(),
                size: o.size().unwrap_or_default(),
            }));
            match resp.next_continuation_token() {
                Some(next) if resp.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(objects)
    }

    async fn delete_bucket(&self) -> Result<()> {
        for object in self.list().await? {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&object.key)
                .send()
                .await
                .map_err(|e| storage_error(&format!("failed to remove {}", object.key), e))?;
        }
        self.client
            .delete_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| storage_error("delete bucket", e))?;
        Ok(())
    }
}

async fn read_part<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(PART_SIZE);
    reader
        .take(PART_SIZE as u64)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| ResticError::stream("upload read", e))?;
    Ok(buf)
}

/// An in-memory pipe feeding [`ObjectStore::put`].
///
/// The reading half fails as soon as the writing half is dropped without [`PipeWriter::close`]
/// or [`PipeWriter::abort_token`] is cancelled, so a stream cut short is never stored.
pub fn upload_pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (writer, reader) = tokio::io::duplex(capacity);
    let abort = CancellationToken::new();
    (
        PipeWriter {
            inner: writer,
            abort: abort.clone(),
            closed: false,
        },
        PipeReader {
            inner: reader,
            abort,
        },
    )
}

fn upload_aborted() -> io::Error {
    io::Error::other("upload stream aborted by the writer")
}

pub struct PipeWriter {
    inner: DuplexStream,
    abort: CancellationToken,
    closed: bool,
}

impl PipeWriter {
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Ends the stream, the reader sees a regular end of file.
    pub async fn close(mut self) -> io::Result<()> {
        self.inner.shutdown().await?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        // runs before `inner` closes, the reader never sees a clean EOF
        if !self.closed {
            self.abort.cancel();
        }
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

pub struct PipeReader {
    inner: DuplexStream,
    abort: CancellationToken,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.abort.is_cancelled() {
            return Poll::Ready(Err(upload_aborted()));
        }
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        if self.abort.is_cancelled() {
            return Poll::Ready(Err(upload_aborted()));
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("http://minio:9000/restore").unwrap(),
            ("http://minio:9000".to_string(), "restore".to_string())
        );
        assert_eq!(
            parse_endpoint("https://s3.example.com/backups/ignored/").unwrap(),
            ("https://s3.example.com".to_string(), "backups".to_string())
        );
    }

    #[test]
    fn test_parse_endpoint_rejects() {
        let err = parse_endpoint("ftp://minio/restore").unwrap_err();
        assert!(err.to_string().contains("wrong scheme 'ftp'"));
        assert!(parse_endpoint("http://minio:9000").is_err());
        assert!(parse_endpoint("not a url").is_err());
    }

    #[tokio::test]
    async fn test_read_part_limits_size() {
        let data = vec![7u8; PART_SIZE + 10];
        let mut reader = data.as_slice();
        assert_eq!(read_part(&mut reader).await.unwrap().len(), PART_SIZE);
        assert_eq!(read_part(&mut reader).await.unwrap().len(), 10);
        assert!(read_part(&mut reader).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_pipe_ends_cleanly() {
        let (mut writer, mut reader) = upload_pipe(16);
        let read = tokio::spawn(async move {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).await.map(|_| data)
        });
        writer.write_all(b"tar.gz bytes").await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(read.await.unwrap().unwrap(), b"tar.gz bytes");
    }

    #[tokio::test]
    async fn test_dropped_pipe_fails_reader() {
        let (mut writer, mut reader) = upload_pipe(16);
        let read = tokio::spawn(async move {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).await
        });
        writer.write_all(b"partial").await.unwrap();
        drop(writer);
        assert!(read.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_aborted_pipe_fails_pending_read() {
        let (writer, mut reader) = upload_pipe(16);
        let abort = writer.abort_token();
        abort.cancel();
        let mut buf = [0u8; 4];
        assert!(reader.read(&mut buf).await.is_err());
        drop(writer);
    }
}
