//! Event Merger
//!
//! Merges the three input streams into a single sequence that is
//! non-decreasing in `(exchange_ts_ns, type_rank, tiebreak_seq)`. The
//! tie-break at equal timestamps is Snapshot < Delta < Trade: snapshots
//! bootstrap and validate, deltas advance the book, trades are applied into
//! the already-current book.
//!
//! Each emitted [`SourcedEvent`] carries the position of its reader *after*
//! the record, so the replay engine can publish exact resume points without
//! reaching back into the readers.

use crate::recon::error::ReconError;
use crate::recon::events::{MarketEvent, OrderKey};
use crate::recon::reader::{ReaderPosition, StreamKind, StreamReader};

/// A forward-only record source the merger can drain.
pub trait RecordSource {
    /// Next record with its per-stream tie-break sequence.
    fn next_record(&mut self) -> Result<Option<(MarketEvent, u64)>, ReconError>;
    /// Position just past the last returned record.
    fn position(&self) -> ReaderPosition;
}

impl RecordSource for StreamReader {
    fn next_record(&mut self) -> Result<Option<(MarketEvent, u64)>, ReconError> {
        StreamReader::next_record(self)
    }

    fn position(&self) -> ReaderPosition {
        StreamReader::position(self)
    }
}

/// A merged event annotated with its source stream and resume position.
#[derive(Debug, Clone)]
pub struct SourcedEvent {
    pub event: MarketEvent,
    pub tiebreak_seq: u64,
    pub stream: StreamKind,
    /// Reader position after this record.
    pub position: ReaderPosition,
}

impl SourcedEvent {
    #[inline]
    pub fn key(&self) -> OrderKey {
        OrderKey {
            event_ts_ns: self.event.exchange_ts_ns(),
            type_rank: self.event.kind().type_rank(),
            tiebreak_seq: self.tiebreak_seq,
        }
    }
}

struct PeekedStream<S> {
    kind: StreamKind,
    source: S,
    peeked: Option<SourcedEvent>,
}

impl<S: RecordSource> PeekedStream<S> {
    fn prime(&mut self) -> Result<(), ReconError> {
        if self.peeked.is_none() {
            if let Some((event, seq)) = self.source.next_record()? {
                let position = self.source.position();
                self.peeked = Some(SourcedEvent {
                    event,
                    tiebreak_seq: seq,
                    stream: self.kind,
                    position,
                });
            }
        }
        Ok(())
    }
}

/// Three-way merger over the input streams.
pub struct EventMerger<S> {
    streams: Vec<PeekedStream<S>>,
    emitted: u64,
    last_key: Option<OrderKey>,
}

impl<S: RecordSource> EventMerger<S> {
    pub fn new(trades: S, snapshots: S, deltas: S) -> Self {
        EventMerger {
            streams: vec![
                PeekedStream {
                    kind: StreamKind::Trades,
                    source: trades,
                    peeked: None,
                },
                PeekedStream {
                    kind: StreamKind::Snapshots,
                    source: snapshots,
                    peeked: None,
                },
                PeekedStream {
                    kind: StreamKind::Deltas,
                    source: deltas,
                    peeked: None,
                },
            ],
            emitted: 0,
            last_key: None,
        }
    }

    /// Total events emitted so far.
    #[inline]
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Next event in merged order, or `None` when all streams are drained.
    pub fn next_event(&mut self) -> Result<Option<SourcedEvent>, ReconError> {
        for stream in &mut self.streams {
            stream.prime()?;
        }

        let min_idx = self
            .streams
            .iter()
            .enumerate()
            .filter_map(|(idx, s)| s.peeked.as_ref().map(|e| (idx, e.key())))
            .min_by_key(|&(_, key)| key)
            .map(|(idx, _)| idx);

        let Some(idx) = min_idx else {
            return Ok(None);
        };
        let event = self.streams[idx].peeked.take().expect("peeked event");

        // The merge key never regresses: readers enforce per-stream
        // timestamp order and min-select preserves it globally.
        let key = event.key();
        debug_assert!(self.last_key.map(|prev| prev <= key).unwrap_or(true));
        self.last_key = Some(key);
        self.emitted += 1;
        Ok(Some(event))
    }

    /// Discard every event at or before the watermark. Used on resume so
    /// the first emitted event is strictly beyond the checkpoint.
    pub fn skip_through(&mut self, watermark: OrderKey) -> Result<u64, ReconError> {
        let mut skipped = 0;
        loop {
            for stream in &mut self.streams {
                stream.prime()?;
            }
            let next_key = self
                .streams
                .iter()
                .filter_map(|s| s.peeked.as_ref().map(|e| e.key()))
                .min();
            match next_key {
                Some(key) if key <= watermark => {
                    self.next_event()?;
                    skipped += 1;
                }
                _ => return Ok(skipped),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recon::events::{DeltaRecord, EventKind, SnapshotRecord, Side, TradeRecord};
    use crate::recon::fixed::FixedPoint;
    use std::collections::VecDeque;

    /// Vec-backed source for merge tests.
    struct VecSource {
        events: VecDeque<MarketEvent>,
        emitted: u64,
    }

    impl VecSource {
        fn new(events: Vec<MarketEvent>) -> Self {
            VecSource {
                events: events.into(),
                emitted: 0,
            }
        }
    }

    impl RecordSource for VecSource {
        fn next_record(&mut self) -> Result<Option<(MarketEvent, u64)>, ReconError> {
            match self.events.pop_front() {
                Some(event) => {
                    let seq = self.emitted;
                    self.emitted += 1;
                    Ok(Some((event, seq)))
                }
                None => Ok(None),
            }
        }

        fn position(&self) -> ReaderPosition {
            ReaderPosition {
                file: None,
                rows_into_file: self.emitted,
                records_emitted: self.emitted,
            }
        }
    }

    fn trade(ts: u64, id: u64) -> MarketEvent {
        MarketEvent::Trade(TradeRecord {
            exchange_ts_ns: ts,
            origin_ts_ns: ts,
            trade_id: id,
            price: FixedPoint::from_int(1),
            quantity: FixedPoint::from_int(1),
            side: Side::Buy,
        })
    }

    fn snapshot(ts: u64, last_update_id: u64) -> MarketEvent {
        MarketEvent::Snapshot(SnapshotRecord {
            exchange_ts_ns: ts,
            last_update_id,
            bids: vec![],
            asks: vec![],
        })
    }

    fn delta(ts: u64, first: u64, last: u64) -> MarketEvent {
        MarketEvent::Delta(DeltaRecord {
            exchange_ts_ns: ts,
            first_update_id: first,
            final_update_id: last,
            bids: vec![],
            asks: vec![],
        })
    }

    fn merger_of(
        trades: Vec<MarketEvent>,
        snapshots: Vec<MarketEvent>,
        deltas: Vec<MarketEvent>,
    ) -> EventMerger<VecSource> {
        EventMerger::new(
            VecSource::new(trades),
            VecSource::new(snapshots),
            VecSource::new(deltas),
        )
    }

    fn drain(merger: &mut EventMerger<VecSource>) -> Vec<SourcedEvent> {
        let mut out = Vec::new();
        while let Some(event) = merger.next_event().unwrap() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_timestamp_order() {
        let mut merger = merger_of(
            vec![trade(1200, 1)],
            vec![snapshot(1000, 100)],
            vec![delta(1100, 101, 101)],
        );
        let kinds: Vec<EventKind> = drain(&mut merger)
            .iter()
            .map(|e| e.event.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![EventKind::Snapshot, EventKind::Delta, EventKind::Trade]
        );
    }

    #[test]
    fn test_tiebreak_at_identical_timestamp() {
        // All three events at t=2000: snapshot first, then delta, then trade.
        let mut merger = merger_of(
            vec![trade(2000, 2)],
            vec![snapshot(2000, 200)],
            vec![delta(2000, 201, 201)],
        );
        let kinds: Vec<EventKind> = drain(&mut merger)
            .iter()
            .map(|e| e.event.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![EventKind::Snapshot, EventKind::Delta, EventKind::Trade]
        );
    }

    #[test]
    fn test_intra_stream_order_preserved() {
        let mut merger = merger_of(
            vec![trade(1000, 1), trade(1000, 2), trade(1000, 3)],
            vec![],
            vec![],
        );
        let ids: Vec<u64> = drain(&mut merger)
            .iter()
            .map(|e| match &e.event {
                MarketEvent::Trade(t) => t.trade_id,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_output_non_decreasing_key() {
        let mut merger = merger_of(
            vec![trade(1000, 1), trade(1500, 2), trade(3000, 3)],
            vec![snapshot(1000, 10), snapshot(2000, 20)],
            vec![delta(1000, 11, 11), delta(1500, 12, 12), delta(2500, 13, 13)],
        );
        let events = drain(&mut merger);
        assert_eq!(events.len(), 8);
        for pair in events.windows(2) {
            assert!(pair[0].key() <= pair[1].key());
        }
    }

    #[test]
    fn test_skip_through_watermark() {
        let mut merger = merger_of(
            vec![trade(1200, 1)],
            vec![snapshot(1000, 100)],
            vec![delta(1100, 101, 101)],
        );
        // Watermark at the delta: only the trade remains.
        let watermark = OrderKey {
            event_ts_ns: 1100,
            type_rank: EventKind::Delta.type_rank(),
            tiebreak_seq: 0,
        };
        let skipped = merger.skip_through(watermark).unwrap();
        assert_eq!(skipped, 2);
        let rest = drain(&mut merger);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].event.kind(), EventKind::Trade);
    }
}
