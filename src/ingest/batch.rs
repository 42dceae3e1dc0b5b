//! Batching producer.
//!
//! Runs on the blocking worker that owns the streaming parser. Records are
//! accumulated into fixed-size [`RecordBatch`] payloads and published onto
//! the bounded channel with `blocking_send`, which suspends the producer
//! while every slot is full - the pipeline's only guard against unbounded
//! queuing. The cancellation token is checked every few thousand records
//! and at every batch boundary; dropping the sender (end of input, fatal
//! parse error, or cancellation) is the sole termination signal consumers
//! observe.

use super::parser::{
    CategoryRecord, ExportParser, ParseFatal, ParsedRecord, RoutePointRecord, SampleRecord,
    SummaryRecord, WorkoutRecord,
};
use std::io::BufRead;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

/// Records per batch. Small batches thrash the database with commits,
/// large ones blow commit latency and memory.
pub const BATCH_SIZE: usize = 25_000;

/// Bounded channel capacity, in batches.
pub const CHANNEL_CAPACITY: usize = 4;

/// Cancellation check cadence within a batch.
const CANCEL_CHECK_INTERVAL: usize = 2_000;

/// A self-contained batch of parsed records, partitioned by kind and moved
/// through the pipeline as one unit.
#[derive(Debug, Default)]
pub struct RecordBatch {
    pub samples: Vec<SampleRecord>,
    pub categories: Vec<CategoryRecord>,
    pub workouts: Vec<WorkoutRecord>,
    pub route_points: Vec<RoutePointRecord>,
    pub summaries: Vec<SummaryRecord>,
    /// Malformed fragments the parser skipped since the previous batch was
    /// sealed; reaches the ledger together with this batch's commit.
    pub parse_skipped: u64,
}

impl RecordBatch {
    fn push(&mut self, record: ParsedRecord) {
        match record {
            ParsedRecord::Sample(sample) => self.samples.push(sample),
            ParsedRecord::Category(category) => self.categories.push(category),
            ParsedRecord::Workout(mut workout) => {
                self.route_points.append(&mut workout.route);
                self.workouts.push(workout);
            }
            ParsedRecord::Summary(summary) => self.summaries.push(summary),
        }
    }

    /// Rows held in memory, route points included (the memory bound).
    pub fn len(&self) -> usize {
        self.samples.len()
            + self.categories.len()
            + self.workouts.len()
            + self.route_points.len()
            + self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical records for ledger accounting. Route points ride with their
    /// workout and are not counted.
    pub fn record_units(&self) -> usize {
        self.samples.len() + self.categories.len() + self.workouts.len() + self.summaries.len()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProducerStats {
    pub records: u64,
    pub batches: u64,
    pub skipped: u64,
}

/// Parse the export and publish batches until input is exhausted, the job
/// is cancelled, or all consumers are gone.
///
/// Returns the producer-side totals; malformed-fragment counts travel with
/// the batches themselves. `Err` is reserved for fatal parse conditions,
/// the job-level failure path.
pub fn run_producer<R: BufRead>(
    mut parser: ExportParser<R>,
    tx: Sender<RecordBatch>,
    cancel: &CancellationToken,
    batch_size: usize,
) -> Result<ProducerStats, ParseFatal> {
    let mut stats = ProducerStats::default();
    let mut batch = RecordBatch::default();
    let mut since_cancel_check = 0usize;

    while let Some(record) = parser.next_record()? {
        batch.push(record);
        stats.records += 1;

        since_cancel_check += 1;
        if since_cancel_check >= CANCEL_CHECK_INTERVAL {
            since_cancel_check = 0;
            if cancel.is_cancelled() {
                log::info!("producer: cancellation observed mid-batch, stopping");
                return Ok(stats);
            }
        }

        if batch.len() >= batch_size {
            batch.parse_skipped = parser.take_skipped();
            stats.skipped += batch.parse_skipped;
            stats.batches += 1;

            if tx.blocking_send(std::mem::take(&mut batch)).is_err() {
                log::warn!("producer: all consumers gone, stopping");
                return Ok(stats);
            }

            if cancel.is_cancelled() {
                log::info!("producer: cancellation observed at batch boundary, stopping");
                return Ok(stats);
            }
        }
    }

    // Final partial batch; also carries any trailing skip counts.
    batch.parse_skipped = parser.take_skipped();
    stats.skipped += batch.parse_skipped;

    if (!batch.is_empty() || batch.parse_skipped > 0) && !cancel.is_cancelled() {
        stats.batches += 1;
        if tx.blocking_send(batch).is_err() {
            log::warn!("producer: all consumers gone before final batch");
        }
    }

    log::info!(
        "producer: parsing complete - {} records, {} batches, {} skipped",
        stats.records,
        stats.batches,
        stats.skipped
    );

    Ok(stats)
}
