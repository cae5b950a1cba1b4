use bytes::Bytes;
use futures::Stream;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Pass-through wrapper over a byte stream that reports the cumulative number
/// of bytes handed to the consumer.
///
/// Chunks are forwarded untouched. The callback runs only after a chunk has
/// been yielded, and never for empty chunks, so reported values strictly
/// increase.
pub struct ProgressStream<S, F> {
    inner: S,
    bytes_sent: u64,
    on_progress: F,
}

impl<S, F> ProgressStream<S, F>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
    F: FnMut(u64) + Unpin,
{
    pub fn new(inner: S, on_progress: F) -> Self {
        Self {
            inner,
            bytes_sent: 0,
            on_progress,
        }
    }
}

impl<S, F> Stream for ProgressStream<S, F>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
    F: FnMut(u64) + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !chunk.is_empty() {
                    this.bytes_sent += chunk.len() as u64;
                    (this.on_progress)(this.bytes_sent);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{StreamExt, stream};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_bytes_pass_through_unchanged() {
        let chunks = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"multipart ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let mut body = ProgressStream::new(stream::iter(chunks), move |sent| {
            seen_clone.lock().unwrap().push(sent);
        });

        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }

        assert_eq!(out, b"hello multipart world");
        assert_eq!(body.bytes_sent, 21);
        assert_eq!(*seen.lock().unwrap(), vec![6, 16, 21]);
    }

    #[tokio::test]
    async fn test_no_progress_before_first_chunk_or_on_error() {
        let chunks = vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated")),
        ];
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_clone = calls.clone();

        let mut body = ProgressStream::new(stream::iter(chunks), move |sent| {
            calls_clone.lock().unwrap().push(sent);
        });
        assert!(calls.lock().unwrap().is_empty());

        assert!(body.next().await.unwrap().is_ok());
        assert!(body.next().await.unwrap().is_err());
        assert!(body.next().await.is_none());
        assert_eq!(*calls.lock().unwrap(), vec![3]);
    }
}
