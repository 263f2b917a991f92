//! Pattern scanner: find every offset where a schema decodes.
//!
//! # Candidates
//!
//! | Mode | Offsets tried |
//! |------|---------------|
//! | `Aligned(n)` | every multiple of `n` inside the scan range (default `n = 4`) |
//! | `PointerTargets` | every offset some valid, word-aligned pointer in the buffer refers to |
//!
//! Pointer-bearing records in GBA ROMs are word aligned, so the default
//! loses no true matches.  `PointerTargets` is far narrower still, but
//! misses structures nothing points at.
//!
//! # Early rejection
//!
//! Before the full decode, each candidate must fit the schema's minimum
//! size and every pointer in its fixed prefix must pass the pointer
//! validator (nullable pointers may also be 0).  Most offsets in a ROM
//! fail here without any allocation.
//!
//! # Parallelism
//!
//! The candidate space is cut into contiguous chunks.  With the `parallel`
//! feature chunks run on the rayon pool and each produces a local match
//! list; the lists are merged at the end.  Cancellation is checked between
//! chunks, so a cancelled scan stops within one chunk's worth of work and
//! returns what it has found so far.
//!
//! Matches may overlap or nest.  No attempt is made to decide which match
//! is the "real" one or which pointer refers to it; that is the caller's job.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use tracing::debug;

use crate::decode::{DecodeLimits, DecodedRecord, Decoder};
use crate::pointer::{self, NULL_POINTER};
use crate::schema::Schema;

/// Default candidate alignment in bytes.
pub const DEFAULT_ALIGNMENT:  usize = 4;
/// Default chunk size: 64 KiB of address space per unit of work.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidates {
    /// Every multiple of the given alignment.
    Aligned(usize),
    /// Only offsets a valid, word-aligned pointer in the buffer refers to.
    PointerTargets,
}

impl Default for Candidates {
    fn default() -> Self { Candidates::Aligned(DEFAULT_ALIGNMENT) }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Which offsets to try.
    pub candidates:   Candidates,
    /// Restrict candidates to this byte range; `None` scans the whole buffer.
    pub range:        Option<Range<usize>>,
    /// Bytes of address space per unit of parallel work.
    pub chunk_size:   usize,
    /// Keep the decoded record of every match, not just its offset.
    pub keep_records: bool,
    pub limits:       DecodeLimits,
    /// Dedicated worker count; `None` uses the global rayon pool.
    pub threads:      Option<usize>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            candidates:   Candidates::default(),
            range:        None,
            chunk_size:   DEFAULT_CHUNK_SIZE,
            keep_records: false,
            limits:       DecodeLimits::default(),
            threads:      None,
        }
    }
}

/// Shared flag for aborting a running scan from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self { Self::default() }

    /// Ask every scan holding a clone of this token to stop.
    pub fn cancel(&self) { self.0.store(true, Ordering::Relaxed) }

    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::Relaxed) }
}

/// Progress callback: `(chunks_done, chunks_total)`.  Called from worker threads.
pub type ProgressFn<'a> = dyn Fn(usize, usize) + Sync + 'a;

// ── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    /// Offsets considered.
    pub candidates:     usize,
    /// Offsets that decoded fully.
    pub matches:        usize,
    /// Offsets rejected by the size and pointer probe alone.
    pub rejected_early: usize,
    pub cancelled:      bool,
}

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Matching offsets; records present only with `keep_records`.
    pub matches: BTreeMap<usize, Option<DecodedRecord>>,
    pub stats:   ScanStats,
}

impl ScanResult {
    /// Matching offsets in ascending order.
    pub fn offsets(&self) -> impl Iterator<Item = usize> + '_ {
        self.matches.keys().copied()
    }

    pub fn contains(&self, offset: usize) -> bool {
        self.matches.contains_key(&offset)
    }

    pub fn record(&self, offset: usize) -> Option<&DecodedRecord> {
        self.matches.get(&offset).and_then(Option::as_ref)
    }

    pub fn len(&self) -> usize { self.matches.len() }

    pub fn is_empty(&self) -> bool { self.matches.is_empty() }
}

// ── Chunking ─────────────────────────────────────────────────────────────────

enum Chunk<'a> {
    Stride { start: usize, end: usize, step: usize },
    Listed(&'a [usize]),
}

impl Chunk<'_> {
    fn for_each(&self, mut f: impl FnMut(usize)) {
        match self {
            Chunk::Stride { start, end, step } => (*start..*end).step_by(*step).for_each(f),
            Chunk::Listed(offsets) => offsets.iter().for_each(|&o| f(o)),
        }
    }
}

#[derive(Default)]
struct ChunkOutcome {
    matches:        Vec<(usize, Option<DecodedRecord>)>,
    candidates:     usize,
    rejected_early: usize,
}

// ── Scanner ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Scanner {
    options: ScanOptions,
    decoder: Decoder,
}

impl Scanner {
    /// A scanner whose decoder uses `options.limits`.
    pub fn new(options: ScanOptions) -> Self {
        let decoder = Decoder::with_limits(options.limits);
        Self { options, decoder }
    }

    pub fn options(&self) -> &ScanOptions { &self.options }

    /// Try every candidate offset; see [`Scanner::scan_with`].
    pub fn scan(&self, buffer: &[u8], schema: &Schema) -> ScanResult {
        self.scan_with(buffer, schema, &CancelToken::new(), None)
    }

    /// Scan `buffer` for `schema`, stopping early once `cancel` is set.
    ///
    /// `progress` is called after each finished chunk, possibly from
    /// several threads at once.  A cancelled scan returns the matches from
    /// the chunks that completed, with `stats.cancelled` set.
    pub fn scan_with(
        &self,
        buffer:   &[u8],
        schema:   &Schema,
        cancel:   &CancelToken,
        progress: Option<&ProgressFn<'_>>,
    ) -> ScanResult {
        let range = self.range(buffer.len());
        let targets: Vec<usize> = match self.options.candidates {
            Candidates::PointerTargets => pointer::pointer_targets(buffer, DEFAULT_ALIGNMENT)
                .into_iter()
                .filter(|o| range.contains(o))
                .collect(),
            Candidates::Aligned(_) => Vec::new(),
        };
        let chunks = self.chunks(range, &targets);

        debug!(
            schema = schema.name(),
            len = buffer.len(),
            chunks = chunks.len(),
            "scan started"
        );

        let outcomes = self.run_chunks(buffer, schema, &chunks, cancel, progress);

        let mut result = ScanResult::default();
        result.stats.cancelled = outcomes.len() < chunks.len() || outcomes.iter().any(Option::is_none);
        for outcome in outcomes.into_iter().flatten() {
            result.stats.candidates += outcome.candidates;
            result.stats.rejected_early += outcome.rejected_early;
            result.matches.extend(outcome.matches);
        }
        result.stats.matches = result.matches.len();

        debug!(
            schema = schema.name(),
            candidates = result.stats.candidates,
            matches = result.stats.matches,
            rejected_early = result.stats.rejected_early,
            cancelled = result.stats.cancelled,
            "scan finished"
        );
        result
    }

    fn range(&self, len: usize) -> Range<usize> {
        match &self.options.range {
            Some(r) => r.start.min(len)..r.end.min(len),
            None => 0..len,
        }
    }

    fn chunks<'a>(&self, range: Range<usize>, targets: &'a [usize]) -> Vec<Chunk<'a>> {
        let chunk_size = self.options.chunk_size.max(1);
        match self.options.candidates {
            Candidates::Aligned(alignment) => {
                let step = alignment.max(1);
                // Whole number of steps per chunk keeps every chunk start aligned.
                let span = chunk_size.div_ceil(step) * step;
                let first = range.start.div_ceil(step) * step;
                (first..range.end)
                    .step_by(span)
                    .map(|start| Chunk::Stride {
                        start,
                        end: start.saturating_add(span).min(range.end),
                        step,
                    })
                    .collect()
            }
            Candidates::PointerTargets => {
                let per_chunk = (chunk_size / DEFAULT_ALIGNMENT).max(1);
                targets.chunks(per_chunk).map(Chunk::Listed).collect()
            }
        }
    }

    /// One entry per chunk attempted; `None` for chunks skipped after cancellation.
    fn run_chunks(
        &self,
        buffer:   &[u8],
        schema:   &Schema,
        chunks:   &[Chunk<'_>],
        cancel:   &CancelToken,
        progress: Option<&ProgressFn<'_>>,
    ) -> Vec<Option<ChunkOutcome>> {
        let total = chunks.len();
        let done = AtomicUsize::new(0);
        let work = |chunk: &Chunk<'_>| -> Option<ChunkOutcome> {
            if cancel.is_cancelled() {
                return None;
            }
            let outcome = self.scan_chunk(buffer, schema, chunk);
            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(cb) = progress {
                cb(n, total);
            }
            Some(outcome)
        };

        // Rayon is an optional dependency; fall back to sequential if unavailable.
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            use tracing::warn;

            let run = || chunks.par_iter().map(&work).collect::<Vec<_>>();
            match self.options.threads {
                Some(n) => match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
                    Ok(pool) => pool.install(run),
                    Err(e) => {
                        warn!(threads = n, error = %e, "falling back to the global pool");
                        run()
                    }
                },
                None => run(),
            }
        }

        #[cfg(not(feature = "parallel"))]
        {
            let mut out = Vec::with_capacity(total);
            for chunk in chunks {
                match work(chunk) {
                    Some(outcome) => out.push(Some(outcome)),
                    None => {
                        debug!(done = out.len(), total, "scan cancelled");
                        break;
                    }
                }
            }
            out
        }
    }

    fn scan_chunk(&self, buffer: &[u8], schema: &Schema, chunk: &Chunk<'_>) -> ChunkOutcome {
        let mut outcome = ChunkOutcome::default();
        chunk.for_each(|offset| {
            outcome.candidates += 1;
            if !passes_probe(buffer, offset, schema) {
                outcome.rejected_early += 1;
                return;
            }
            if let Ok(record) = self.decoder.decode(buffer, offset, schema) {
                outcome.matches.push((offset, self.options.keep_records.then_some(record)));
            }
        });
        outcome
    }
}

/// Size check plus pointer validation of the schema's fixed prefix.
pub fn passes_probe(buffer: &[u8], offset: usize, schema: &Schema) -> bool {
    let len = buffer.len();
    if offset.checked_add(schema.min_size()).map_or(true, |end| end > len) {
        return false;
    }
    // Probe positions lie inside the fixed prefix, which min_size covers.
    schema.probe().iter().all(|probe| {
        let at = offset + probe.at;
        let raw = LittleEndian::read_u32(&buffer[at..at + 4]);
        (probe.nullable && raw == NULL_POINTER) || pointer::is_pointer(raw, len)
    })
}

/// Scan with default options.
pub fn scan(buffer: &[u8], schema: &Schema) -> ScanResult {
    Scanner::default().scan(buffer, schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer::to_rom_pointer;
    use crate::schema::SchemaBuilder;

    fn pair() -> Schema {
        SchemaBuilder::new("pair").pointer("a").nullable_pointer("b").build().unwrap()
    }

    fn put_u32(buf: &mut [u8], at: usize, v: u32) {
        buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    #[test]
    fn probe_rejects_bad_prefix_pointer() {
        let s = pair();
        let mut buf = vec![0u8; 0x20];
        assert!(!passes_probe(&buf, 0, &s));
        put_u32(&mut buf, 0, to_rom_pointer(0x10));
        assert!(passes_probe(&buf, 0, &s));
        put_u32(&mut buf, 4, 0x1234_5678);
        assert!(!passes_probe(&buf, 0, &s));
        assert!(!passes_probe(&buf, 0x1C, &s));
    }

    #[test]
    fn finds_aligned_matches() {
        let s = pair();
        let mut buf = vec![0u8; 0x100];
        put_u32(&mut buf, 0x10, to_rom_pointer(0x80));
        put_u32(&mut buf, 0x40, to_rom_pointer(0x90));
        put_u32(&mut buf, 0x44, to_rom_pointer(0x40));

        let result = scan(&buf, &s);
        // 0x44 matches too: its `a` is the pointer at 0x44, its `b` is null.
        assert_eq!(result.offsets().collect::<Vec<_>>(), vec![0x10, 0x40, 0x44]);
        assert_eq!(result.stats.candidates, 0x100 / 4);
        assert_eq!(result.stats.matches, 3);
        assert!(!result.stats.cancelled);
        assert!(result.record(0x10).is_none());
    }

    #[test]
    fn keeps_records_on_request() {
        let s = pair();
        let mut buf = vec![0u8; 0x40];
        put_u32(&mut buf, 0x08, to_rom_pointer(0x20));
        let scanner = Scanner::new(ScanOptions { keep_records: true, ..ScanOptions::default() });
        let result = scanner.scan(&buf, &s);
        assert_eq!(result.len(), 1);
        let rec = result.record(0x08).unwrap();
        assert_eq!(rec.get("b"), Some(&crate::decode::Value::Absent));
    }

    #[test]
    fn small_chunks_match_single_chunk() {
        let s = pair();
        let mut buf = vec![0u8; 0x400];
        for at in (0..0x400).step_by(0x30) {
            put_u32(&mut buf, at, to_rom_pointer(0x3F0));
        }
        let whole = scan(&buf, &s);
        let chunked = Scanner::new(ScanOptions { chunk_size: 10, ..ScanOptions::default() }).scan(&buf, &s);
        assert_eq!(whole.matches, chunked.matches);
        assert_eq!(whole.stats, chunked.stats);
    }

    #[test]
    fn range_restricts_candidates() {
        let s = pair();
        let mut buf = vec![0u8; 0x100];
        put_u32(&mut buf, 0x10, to_rom_pointer(0x80));
        put_u32(&mut buf, 0xC0, to_rom_pointer(0x80));
        let scanner = Scanner::new(ScanOptions { range: Some(0x81..0x1000), ..ScanOptions::default() });
        let result = scanner.scan(&buf, &s);
        assert_eq!(result.offsets().collect::<Vec<_>>(), vec![0xC0]);
        // 0x84..0x100 step 4
        assert_eq!(result.stats.candidates, 31);
    }

    #[test]
    fn pointer_targets_mode_only_tries_targets() {
        let s = pair();
        let mut buf = vec![0u8; 0x100];
        // A match at 0x10 that nothing points at, and one at 0x60 that is referenced.
        put_u32(&mut buf, 0x10, to_rom_pointer(0xF0));
        put_u32(&mut buf, 0x60, to_rom_pointer(0xF0));
        put_u32(&mut buf, 0xA0, to_rom_pointer(0x60));

        let scanner = Scanner::new(ScanOptions { candidates: Candidates::PointerTargets, ..ScanOptions::default() });
        let result = scanner.scan(&buf, &s);
        assert_eq!(result.offsets().collect::<Vec<_>>(), vec![0x60]);
        // Targets: 0x60 and 0xF0.
        assert_eq!(result.stats.candidates, 2);
    }

    #[test]
    fn dedicated_pool_matches_default() {
        let s = pair();
        let mut buf = vec![0u8; 0x400];
        for at in (0..0x400).step_by(0x40) {
            put_u32(&mut buf, at, to_rom_pointer(0x3F0));
        }
        let pooled = Scanner::new(ScanOptions { threads: Some(2), chunk_size: 0x40, ..ScanOptions::default() });
        assert_eq!(pooled.scan(&buf, &s).matches, scan(&buf, &s).matches);
    }

    #[test]
    fn cancelled_before_start_returns_nothing() {
        let s = pair();
        let mut buf = vec![0u8; 0x1000];
        put_u32(&mut buf, 0x10, to_rom_pointer(0x80));
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = Scanner::default().scan_with(&buf, &s, &cancel, None);
        assert!(result.stats.cancelled);
        assert!(result.is_empty());
    }

    #[test]
    fn progress_reports_every_chunk() {
        let s = pair();
        let buf = vec![0u8; 0x1000];
        let calls = AtomicUsize::new(0);
        let progress = |_done: usize, total: usize| {
            assert_eq!(total, 16);
            calls.fetch_add(1, Ordering::Relaxed);
        };
        let scanner = Scanner::new(ScanOptions { chunk_size: 0x100, ..ScanOptions::default() });
        scanner.scan_with(&buf, &s, &CancelToken::new(), Some(&progress));
        assert_eq!(calls.load(Ordering::Relaxed), 16);
    }
}
