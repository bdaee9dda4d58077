//! Fetch → decode → merge pipeline.
//!
//! For every block range, headers are fetched first, then one task per
//! protocol fetches and decodes that protocol's logs concurrently. The
//! per-protocol results are merged into global `(block, logIndex)` order and
//! deduplicated by [`EventId`], so the output does not depend on which
//! decoder finished first.
//!
//! [`DecodePipeline::spawn`] runs ranges ahead of the aggregator on a
//! bounded channel; cancelling the token stops all in-flight work.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use defindex_core::error::{DecodeError, IndexerError};
use defindex_core::event::DomainEvent;
use defindex_core::types::{BlockSummary, EventId, ProtocolId};

use crate::decoder::{DecoderSet, ProtocolDecoder};
use crate::fetcher::{LogFetcher, RawLog};

/// Concurrent header requests per range.
const HEADER_CONCURRENCY: usize = 8;

/// A log that was recognized but could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeWarning {
    pub protocol: ProtocolId,
    pub tx_hash: String,
    pub log_index: String,
    pub error: DecodeError,
}

/// Everything the aggregator needs for a contiguous block range.
#[derive(Debug, Clone, Default)]
pub struct DecodedBatch {
    pub from: u64,
    pub to: u64,
    /// Headers for every block in `[from, to]`, ascending.
    pub blocks: Vec<BlockSummary>,
    /// Events in `(block, logIndex)` order, unique by id.
    pub events: Vec<DomainEvent>,
    pub decode_warnings: Vec<DecodeWarning>,
}

impl DecodedBatch {
    /// Events belonging to block `number`.
    pub fn events_in_block(&self, number: u64) -> impl Iterator<Item = &DomainEvent> {
        self.events.iter().filter(move |e| e.block_number == number)
    }
}

struct ProtocolOutput {
    events: Vec<DomainEvent>,
    warnings: Vec<DecodeWarning>,
}

/// Split `[from, to]` into consecutive ranges of at most `size` blocks.
pub fn split_range(from: u64, to: u64, size: u64) -> Vec<(u64, u64)> {
    let size = size.max(1);
    let mut ranges = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start.saturating_add(size - 1).min(to);
        ranges.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    ranges
}

#[derive(Clone)]
pub struct DecodePipeline {
    fetcher: LogFetcher,
    decoders: DecoderSet,
}

impl DecodePipeline {
    pub fn new(fetcher: LogFetcher, decoders: DecoderSet) -> Self {
        Self { fetcher, decoders }
    }

    pub fn fetcher(&self) -> &LogFetcher {
        &self.fetcher
    }

    pub fn decoders(&self) -> &DecoderSet {
        &self.decoders
    }

    /// Fetch, decode and merge one block range.
    pub async fn fetch_range(
        &self,
        from: u64,
        to: u64,
        cancel: &CancellationToken,
    ) -> Result<DecodedBatch, IndexerError> {
        let blocks = self.headers(from, to).await?;
        let headers: Arc<BTreeMap<u64, BlockSummary>> =
            Arc::new(blocks.iter().map(|b| (b.number, b.clone())).collect());

        let (tx, mut rx) = mpsc::channel(self.decoders.len().max(1));
        let mut tasks = Vec::with_capacity(self.decoders.len());
        for decoder in self.decoders.decoders() {
            let decoder = Arc::clone(decoder);
            let fetcher = self.fetcher.clone();
            let headers = Arc::clone(&headers);
            let cancel = cancel.clone();
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                let protocol = decoder.protocol();
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(IndexerError::Aborted {
                        reason: format!("{protocol} fetch cancelled"),
                    }),
                    r = fetch_and_decode(decoder.as_ref(), &fetcher, &headers, from, to) => r,
                };
                // The receiver only goes away when the range is abandoned.
                let _ = tx.send((protocol, result)).await;
            }));
        }
        drop(tx);

        let mut events = Vec::new();
        let mut warnings = Vec::new();
        let mut failure = None;
        while let Some((protocol, result)) = rx.recv().await {
            match result {
                Ok(output) => {
                    tracing::debug!(
                        %protocol,
                        from,
                        to,
                        events = output.events.len(),
                        warnings = output.warnings.len(),
                        "Protocol range decoded"
                    );
                    events.extend(output.events);
                    warnings.extend(output.warnings);
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        for task in tasks {
            task.await
                .map_err(|e| IndexerError::Other(format!("decode task failed: {e}")))?;
        }
        if let Some(e) = failure {
            return Err(e);
        }

        Ok(DecodedBatch {
            from,
            to,
            blocks,
            events: merge(events),
            decode_warnings: warnings,
        })
    }

    async fn headers(&self, from: u64, to: u64) -> Result<Vec<BlockSummary>, IndexerError> {
        let head = self.fetcher.head_block_number().await?;
        if to > head {
            return Err(IndexerError::ChainTip { requested: to, head });
        }
        let fetcher = &self.fetcher;
        let blocks: Vec<Option<BlockSummary>> = stream::iter(from..=to)
            .map(|n| fetcher.block(n))
            .buffered(HEADER_CONCURRENCY)
            .try_collect()
            .await?;
        blocks
            .into_iter()
            .zip(from..=to)
            .map(|(b, n)| {
                b.ok_or_else(|| IndexerError::SourceUnavailable(format!("block {n} not available")))
            })
            .collect()
    }

    /// Run `ranges` in order on a background task, sending each batch into a
    /// channel of `capacity`. The first error is sent and ends the task.
    pub fn spawn(
        &self,
        ranges: Vec<(u64, u64)>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<Result<DecodedBatch, IndexerError>>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pipeline = self.clone();
        let handle = tokio::spawn(async move {
            for (from, to) in ranges {
                if cancel.is_cancelled() {
                    break;
                }
                let result = pipeline.fetch_range(from, to, &cancel).await;
                let failed = result.is_err();
                let sent = tokio::select! {
                    _ = cancel.cancelled() => false,
                    r = tx.send(result) => r.is_ok(),
                };
                if failed || !sent {
                    break;
                }
            }
        });
        (rx, handle)
    }
}

async fn fetch_and_decode(
    decoder: &dyn ProtocolDecoder,
    fetcher: &LogFetcher,
    headers: &BTreeMap<u64, BlockSummary>,
    from: u64,
    to: u64,
) -> Result<ProtocolOutput, IndexerError> {
    let protocol = decoder.protocol();
    let logs = fetcher.fetch_logs(&decoder.filter(), from, to).await?;
    let mut out = ProtocolOutput {
        events: Vec::with_capacity(logs.len()),
        warnings: Vec::new(),
    };
    for mut log in logs {
        match stamp(&mut log, headers) {
            Ok(()) => {}
            Err(Stamp::Reorged(e)) => return Err(e),
            Err(Stamp::Malformed(error)) => {
                out.warnings.push(warning(protocol, &log, error));
                continue;
            }
        }
        match decoder.decode(&log) {
            Ok(Some(event)) => out.events.push(event),
            Ok(None) => {}
            Err(error) => out.warnings.push(warning(protocol, &log, error)),
        }
    }
    Ok(out)
}

enum Stamp {
    Reorged(IndexerError),
    Malformed(DecodeError),
}

/// Check the log against its block header and fill in the block timestamp.
fn stamp(log: &mut RawLog, headers: &BTreeMap<u64, BlockSummary>) -> Result<(), Stamp> {
    let number = log.block_number_u64().map_err(Stamp::Malformed)?;
    let header = headers.get(&number).ok_or_else(|| {
        Stamp::Malformed(DecodeError::MalformedLog {
            reason: format!("log for block {number} outside the requested range"),
        })
    })?;
    if !log.block_hash.eq_ignore_ascii_case(&header.hash) {
        return Err(Stamp::Reorged(IndexerError::ReorgDetected {
            block_number: number,
            expected: header.hash.clone(),
            actual: log.block_hash.to_ascii_lowercase(),
        }));
    }
    if log.block_timestamp.is_none() {
        log.block_timestamp = Some(format!("0x{:x}", header.timestamp.max(0)));
    }
    Ok(())
}

fn warning(protocol: ProtocolId, log: &RawLog, error: DecodeError) -> DecodeWarning {
    tracing::warn!(
        %protocol,
        tx_hash = %log.tx_hash,
        log_index = %log.log_index,
        error = %error,
        "Skipping undecodable log"
    );
    DecodeWarning {
        protocol,
        tx_hash: log.tx_hash.clone(),
        log_index: log.log_index.clone(),
        error,
    }
}

/// Sort by chain position and keep the first event for each id.
pub fn merge(mut events: Vec<DomainEvent>) -> Vec<DomainEvent> {
    events.sort_by(|a, b| a.position().cmp(&b.position()).then_with(|| a.id.cmp(&b.id)));
    let mut seen: BTreeSet<EventId> = BTreeSet::new();
    events.retain(|e| seen.insert(e.id.clone()));
    events
}
