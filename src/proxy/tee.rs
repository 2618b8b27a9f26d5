//! Relay a segment stream to the client while retaining it for the cache.
//!
//! Chunks pass through untouched. The copy is committed to the segment cache
//! only when the origin stream ends cleanly; an origin error, an oversized
//! body or the client going away (the stream being dropped early) discards
//! it, so a partial body is never visible to other readers.

use crate::{
    cache::{CachedSegment, SegmentCache},
    origin::ByteStream,
};
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, warn};

pub struct CachingStream {
    inner: ByteStream,
    cache: SegmentCache,
    key: String,
    content_type: String,
    /// `None` once the copy has been abandoned or committed
    buffer: Option<BytesMut>,
    limit: usize,
    /// Declared body length; reaching it commits without waiting for the end
    expected_len: Option<u64>,
    finished: bool,
}

impl CachingStream {
    pub fn new(
        inner: ByteStream,
        cache: SegmentCache,
        key: String,
        content_type: String,
        limit: usize,
    ) -> Self {
        Self {
            inner,
            cache,
            key,
            content_type,
            buffer: Some(BytesMut::new()),
            limit,
            expected_len: None,
            finished: false,
        }
    }

    /// Commit as soon as `len` bytes have been seen. The client can have the
    /// whole body before the end of the stream is polled.
    pub fn with_expected_len(mut self, len: Option<u64>) -> Self {
        self.expected_len = len;
        self
    }

    fn commit(&mut self) {
        if let Some(buf) = self.buffer.take() {
            self.cache.insert(
                &self.key,
                CachedSegment {
                    body: buf.freeze(),
                    content_type: self.content_type.clone(),
                },
            );
        }
        self.finished = true;
    }
}

impl Stream for CachingStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(buf) = this.buffer.as_mut() {
                    if buf.len() + chunk.len() > this.limit {
                        debug!(
                            "Segment {} exceeds {} bytes, not caching",
                            this.key, this.limit
                        );
                        this.buffer = None;
                    } else {
                        buf.extend_from_slice(&chunk);
                    }
                }
                let complete = this.expected_len.is_some_and(|expected| {
                    this.buffer
                        .as_ref()
                        .is_some_and(|buf| buf.len() as u64 == expected)
                });
                if complete {
                    this.commit();
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                warn!("Origin stream failed for {}: {}", this.key, e);
                this.buffer = None;
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.commit();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CachingStream {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Segment relay for {} abandoned, discarding partial copy", self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::time::Duration;

    const KEY: &str = "https://origin.example/seg0.ts";

    fn cache() -> SegmentCache {
        SegmentCache::new("segment", Duration::from_secs(60), 16)
    }

    fn chunks(parts: Vec<std::io::Result<Bytes>>) -> ByteStream {
        stream::iter(parts).boxed()
    }

    fn tee(inner: ByteStream, cache: &SegmentCache, limit: usize) -> CachingStream {
        CachingStream::new(inner, cache.clone(), KEY.to_string(), "video/MP2T".to_string(), limit)
    }

    #[tokio::test]
    async fn relays_chunks_and_caches_complete_body() {
        let cache = cache();
        let mut s = tee(
            chunks(vec![Ok(Bytes::from("hello ")), Ok(Bytes::from("world"))]),
            &cache,
            1024,
        );

        let mut relayed = Vec::new();
        while let Some(chunk) = s.next().await {
            relayed.push(chunk.unwrap());
        }

        assert_eq!(relayed, vec![Bytes::from("hello "), Bytes::from("world")]);
        let cached = cache.get(KEY).expect("complete body should be cached");
        assert_eq!(cached.body, Bytes::from("hello world"));
        assert_eq!(cached.content_type, "video/MP2T");
    }

    #[tokio::test]
    async fn origin_error_discards_copy() {
        let cache = cache();
        let mut s = tee(
            chunks(vec![
                Ok(Bytes::from("part")),
                Err(std::io::Error::other("reset")),
            ]),
            &cache,
            1024,
        );

        assert!(s.next().await.unwrap().is_ok());
        assert!(s.next().await.unwrap().is_err());
        assert!(s.next().await.is_none());
        assert!(cache.get(KEY).is_none());
    }

    #[tokio::test]
    async fn early_drop_discards_copy() {
        let cache = cache();
        let mut s = tee(
            chunks(vec![Ok(Bytes::from("a")), Ok(Bytes::from("b"))]),
            &cache,
            1024,
        );

        assert!(s.next().await.is_some());
        drop(s);

        assert!(cache.get(KEY).is_none());
    }

    #[tokio::test]
    async fn commits_once_declared_length_is_reached() {
        let cache = cache();
        let mut s = tee(
            chunks(vec![Ok(Bytes::from("ab")), Ok(Bytes::from("cd"))]),
            &cache,
            1024,
        )
        .with_expected_len(Some(4));

        s.next().await.unwrap().unwrap();
        assert!(cache.get(KEY).is_none());
        s.next().await.unwrap().unwrap();
        assert_eq!(cache.get(KEY).unwrap().body, Bytes::from("abcd"));
    }

    #[tokio::test]
    async fn oversized_body_is_relayed_but_not_cached() {
        let cache = cache();
        let mut s = tee(
            chunks(vec![Ok(Bytes::from("12345")), Ok(Bytes::from("67890"))]),
            &cache,
            8,
        );

        let mut total = 0;
        while let Some(chunk) = s.next().await {
            total += chunk.unwrap().len();
        }

        assert_eq!(total, 10);
        assert!(cache.get(KEY).is_none());
    }
}
