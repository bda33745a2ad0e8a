//! Incremental decoding of the record stream.
//!
//! `/filelist-stream` answers with a chunked body of JSON records, each
//! followed by the two-byte separator `\N` (a backslash and a capital N, not
//! a newline). Chunk boundaries are arbitrary: a record, the separator, or a
//! multi-byte UTF-8 character may be split across chunks. Decoding works on
//! raw bytes so that none of those splits matter.
//!
//! The separator is not escaped by the server. A record whose text contains
//! a literal backslash followed by `N` serializes to `\\N`, which still
//! contains the separator, so the record is split in two. Under
//! [`MalformedPolicy::Skip`] both halves are dropped and the record is lost
//! from the load; under [`MalformedPolicy::Fail`] the load aborts.
//!
//! The expected record count comes from the `totalDataCount` response header
//! and only feeds progress reporting; a missing header means "unknown".

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{ready, Stream, StreamExt};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::index::DocumentIndex;
use crate::models::DocumentRecord;

pub const RECORD_SEPARATOR: &[u8] = b"\\N";

/// Response header carrying the declared record count.
pub const TOTAL_COUNT_HEADER: &str = "totalDataCount";

/// Splits a byte stream into separator-delimited fragments.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    buf: Vec<u8>,
    /// Offset in `buf` before which no separator can start.
    scan_from: usize,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every fragment it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);

        let mut fragments = Vec::new();
        let mut start = 0;
        let mut cursor = self.scan_from;
        while let Some(pos) = find(&self.buf[cursor..], RECORD_SEPARATOR) {
            let end = cursor + pos;
            fragments.push(self.buf[start..end].to_vec());
            start = end + RECORD_SEPARATOR.len();
            cursor = start;
        }
        self.buf.drain(..start);
        // The tail may hold the first bytes of a separator.
        self.scan_from = self.buf.len().saturating_sub(RECORD_SEPARATOR.len() - 1);
        fragments
    }

    /// Bytes buffered after the last separator.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Take the trailing fragment at end of stream, if it is non-empty.
    pub fn take_tail(&mut self) -> Option<Vec<u8>> {
        self.scan_from = 0;
        let tail = mem::take(&mut self.buf);
        if tail.is_empty() {
            None
        } else {
            Some(tail)
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// What to do with a fragment that does not parse as a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MalformedPolicy {
    /// Log and drop the fragment, keep going.
    #[default]
    Skip,
    /// Stop the stream with [`Error::MalformedRecord`].
    Fail,
}

/// Parse one fragment. Whitespace-only fragments (the empty piece after a
/// trailing separator, keep-alive newlines) yield `Ok(None)`.
fn parse_fragment(bytes: &[u8]) -> std::result::Result<Option<DocumentRecord>, String> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(bytes)
        .map(Some)
        .map_err(|e| e.to_string())
}

/// Adapts a stream of body chunks into a stream of decoded records.
pub struct RecordStream<S> {
    chunks: S,
    decoder: RecordDecoder,
    ready: VecDeque<Vec<u8>>,
    policy: MalformedPolicy,
    fragments: u64,
    done: bool,
}

impl<S> RecordStream<S> {
    pub fn new(chunks: S, policy: MalformedPolicy) -> Self {
        Self {
            chunks,
            decoder: RecordDecoder::new(),
            ready: VecDeque::new(),
            policy,
            fragments: 0,
            done: false,
        }
    }
}

impl<S, B, E> Stream for RecordStream<S>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    type Item = Result<DocumentRecord>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            while let Some(fragment) = this.ready.pop_front() {
                this.fragments += 1;
                match parse_fragment(&fragment) {
                    Ok(Some(record)) => return Poll::Ready(Some(Ok(record))),
                    Ok(None) => {}
                    Err(reason) => match this.policy {
                        MalformedPolicy::Skip => {
                            warn!(index = this.fragments, %reason, "skipping malformed record");
                        }
                        MalformedPolicy::Fail => {
                            this.ready.clear();
                            this.done = true;
                            return Poll::Ready(Some(Err(Error::MalformedRecord {
                                index: this.fragments,
                                reason,
                            })));
                        }
                    },
                }
            }
            if this.done {
                return Poll::Ready(None);
            }
            match ready!(Pin::new(&mut this.chunks).poll_next(cx)) {
                Some(Ok(chunk)) => {
                    let fragments = this.decoder.push(chunk.as_ref());
                    this.ready.extend(fragments);
                }
                Some(Err(e)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(Error::Transport(e.to_string()))));
                }
                None => {
                    this.done = true;
                    if let Some(tail) = this.decoder.take_tail() {
                        this.ready.push_back(tail);
                    }
                }
            }
        }
    }
}

/// Progress of a stream load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadProgress {
    /// Records ingested so far.
    pub current: u64,
    /// Declared total, `None` when the server did not send one.
    pub total: Option<u64>,
    pub finished: bool,
}

impl LoadProgress {
    pub fn start(total: Option<u64>) -> Self {
        Self {
            current: 0,
            total,
            finished: false,
        }
    }

    /// Completion in `[0, 1]`.
    ///
    /// Without a declared total this is 0 until the first record arrives and
    /// 1 from then on.
    pub fn fraction(&self) -> f64 {
        match self.total {
            Some(0) | None if self.current == 0 && !self.finished => 0.0,
            Some(0) | None => 1.0,
            Some(total) => (self.current as f64 / total as f64).min(1.0),
        }
    }
}

impl fmt::Display for LoadProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total {
            Some(total) => write!(f, "{}/{}", self.current, total),
            None => write!(f, "{}/?", self.current),
        }
    }
}

/// Parse a `totalDataCount` header value. Anything that is not a
/// non-negative integer counts as unknown.
pub fn parse_total(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.trim().parse::<i64>().ok()).and_then(|n| u64::try_from(n).ok())
}

/// Drives a [`RecordStream`] to completion, reporting progress per record.
#[derive(Debug, Clone, Copy)]
pub struct StreamIngestor {
    total: Option<u64>,
    policy: MalformedPolicy,
}

impl StreamIngestor {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total,
            policy: MalformedPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: MalformedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Feed every record of `chunks` to `sink` along with the progress after
    /// that record. Returns the final progress.
    pub async fn run<S, B, E, F>(self, chunks: S, mut sink: F) -> Result<LoadProgress>
    where
        S: Stream<Item = std::result::Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: fmt::Display,
        F: FnMut(DocumentRecord, LoadProgress),
    {
        let mut progress = LoadProgress::start(self.total);
        let mut records = RecordStream::new(chunks, self.policy);
        while let Some(record) = records.next().await {
            let record = record?;
            progress.current += 1;
            sink(record, progress);
        }
        progress.finished = true;
        Ok(progress)
    }

    /// Clear `index`, fill it from `chunks`, and mark it initialized.
    ///
    /// On error the index keeps whatever was ingested so far and stays
    /// uninitialized.
    pub async fn load_into<S, B, E, P>(
        self,
        index: &mut DocumentIndex,
        chunks: S,
        mut on_progress: P,
    ) -> Result<LoadProgress>
    where
        S: Stream<Item = std::result::Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: fmt::Display,
        P: FnMut(LoadProgress),
    {
        index.clear();
        on_progress(LoadProgress::start(self.total));
        let progress = self
            .run(chunks, |record, progress| {
                index.add(record);
                on_progress(progress);
            })
            .await?;
        index.mark_initialized();
        on_progress(progress);
        info!(records = progress.current, total = ?progress.total, "stream load complete");
        Ok(progress)
    }
}
