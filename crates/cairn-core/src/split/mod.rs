pub mod rollsum;

use std::io::Read;

use cairn_types::error::{CairnError, Result};

use self::rollsum::Rollsum;

/// Default boundary significance for file content (`bup.blobbits`).
pub const DEFAULT_BLOB_BITS: u32 = 13;
/// Boundary significance for directory-listing tree-split. Fixed, not
/// configurable.
pub const TREE_SPLIT_BITS: u32 = 13;
/// Accepted range for `bup.blobbits`.
pub const MIN_BLOB_BITS: u32 = 9;
pub const MAX_BLOB_BITS: u32 = 22;

/// Hard ceiling on blob size: a blob is closed unconditionally once it
/// reaches `4 * 2^bits` bytes, so pathological streams that never hit a
/// natural boundary still split.
pub fn max_blob_size(bits: u32) -> usize {
    4usize << bits
}

fn boundary_mask(bits: u32) -> u32 {
    (1u32 << bits) - 1
}

/// Content-defined chunker: segments a byte stream into blobs at
/// positions chosen by the rolling checksum, independent of how the
/// reader delivers the bytes.
///
/// Yields `(blob_bytes, level)`. A natural boundary occurs after a byte
/// whose rolled digest has its low `bits` bits clear; the boundary's
/// level is the count of trailing one bits above those. Forced splits
/// (hard ceiling) and the final partial blob carry level 0; the tree
/// builder closes any still-open subtrees when the stream ends.
///
/// Buffers at most one blob plus one read chunk.
pub struct HashSplitter<R: Read> {
    reader: R,
    bits: u32,
    max_blob: usize,
    rollsum: Rollsum,
    blob: Vec<u8>,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_len: usize,
    eof: bool,
}

const READ_CHUNK: usize = 64 * 1024;

impl<R: Read> HashSplitter<R> {
    pub fn new(reader: R, bits: u32) -> Self {
        HashSplitter {
            reader,
            bits,
            max_blob: max_blob_size(bits),
            rollsum: Rollsum::new(),
            blob: Vec::new(),
            read_buf: vec![0; READ_CHUNK],
            read_pos: 0,
            read_len: 0,
            eof: false,
        }
    }

    fn refill(&mut self) -> Result<()> {
        loop {
            match self.reader.read(&mut self.read_buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.read_pos = 0;
                    self.read_len = n;
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CairnError::Input(format!("read failed: {e}"))),
            }
        }
    }

    /// Close the current blob and reset the checksum so the next blob's
    /// boundaries depend only on its own content.
    fn take_blob(&mut self) -> Vec<u8> {
        self.rollsum = Rollsum::new();
        std::mem::take(&mut self.blob)
    }
}

impl<R: Read> Iterator for HashSplitter<R> {
    type Item = Result<(Vec<u8>, u32)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mask = boundary_mask(self.bits);
        loop {
            if self.read_pos == self.read_len {
                if self.eof {
                    if self.blob.is_empty() {
                        return None;
                    }
                    return Some(Ok((self.take_blob(), 0)));
                }
                if let Err(e) = self.refill() {
                    return Some(Err(e));
                }
                continue;
            }

            while self.read_pos < self.read_len {
                let byte = self.read_buf[self.read_pos];
                self.read_pos += 1;
                self.blob.push(byte);
                self.rollsum.roll(byte);

                let digest = self.rollsum.digest();
                if digest & mask == 0 {
                    let level = (digest >> self.bits).trailing_ones();
                    return Some(Ok((self.take_blob(), level)));
                }
                if self.blob.len() >= self.max_blob {
                    return Some(Ok((self.take_blob(), 0)));
                }
            }
        }
    }
}

/// Boundary detector over a stream of whole records. Splits only at
/// record ends; `feed` returns the boundary level when the record
/// closes a group, `None` otherwise.
///
/// This is the seam the tree builders consume, so tests can substitute
/// a deterministic implementation by constructor injection.
pub trait RecordSplitter {
    fn feed(&mut self, record: &[u8]) -> Option<u32>;
}

/// Production record splitter: rolls each record's bytes through the
/// checksum and applies the same boundary predicate as the byte
/// splitter at record granularity.
pub struct RollsumRecordSplitter {
    rollsum: Rollsum,
    bits: u32,
}

impl RollsumRecordSplitter {
    pub fn new(bits: u32) -> Self {
        RollsumRecordSplitter {
            rollsum: Rollsum::new(),
            bits,
        }
    }
}

impl RecordSplitter for RollsumRecordSplitter {
    fn feed(&mut self, record: &[u8]) -> Option<u32> {
        for &byte in record {
            self.rollsum.roll(byte);
        }
        let digest = self.rollsum.digest();
        if digest & boundary_mask(self.bits) == 0 {
            self.rollsum = Rollsum::new();
            Some((digest >> self.bits).trailing_ones())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn split_all(data: &[u8], bits: u32) -> Vec<(Vec<u8>, u32)> {
        HashSplitter::new(Cursor::new(data.to_vec()), bits)
            .map(|r| r.expect("split should succeed"))
            .collect()
    }

    #[test]
    fn blobs_cover_entire_input() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i * 31 % 256) as u8).collect();
        let blobs = split_all(&data, 10);
        let rejoined: Vec<u8> = blobs.iter().flat_map(|(b, _)| b.clone()).collect();
        assert_eq!(rejoined, data);
    }

    #[test]
    fn empty_stream_yields_nothing() {
        assert!(split_all(b"", 13).is_empty());
    }

    #[test]
    fn respects_hard_ceiling() {
        // All-zero input never hits a natural boundary, so every blob
        // must close at exactly the hard ceiling.
        let bits = 13;
        let data = vec![0u8; 2 * max_blob_size(bits)];
        let blobs = split_all(&data, bits);
        assert_eq!(blobs.len(), 2);
        for (blob, level) in &blobs {
            assert_eq!(blob.len(), max_blob_size(bits));
            assert_eq!(*level, 0);
        }
    }

    #[test]
    fn ceiling_stream_splits_exactly_once() {
        let bits = 13;
        let data = vec![0u8; max_blob_size(bits)];
        let blobs = split_all(&data, bits);
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].0.len(), max_blob_size(bits));
    }

    #[test]
    fn split_points_do_not_depend_on_read_sizes() {
        // The indexer may deliver bytes in arbitrary chunks; split
        // points must not move.
        struct DribbleReader {
            data: Vec<u8>,
            pos: usize,
            step: usize,
        }
        impl std::io::Read for DribbleReader {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let n = self
                    .step
                    .min(buf.len())
                    .min(self.data.len() - self.pos);
                buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
                self.pos += n;
                Ok(n)
            }
        }

        let data: Vec<u8> = (0..200_000u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
        let baseline = split_all(&data, 13);

        for step in [1usize, 7, 4096, 7919] {
            let reader = DribbleReader {
                data: data.clone(),
                pos: 0,
                step,
            };
            let blobs: Vec<(Vec<u8>, u32)> = HashSplitter::new(reader, 13)
                .map(|r| r.unwrap())
                .collect();
            assert_eq!(blobs, baseline, "split points moved at read step {step}");
        }
    }

    #[test]
    fn shared_suffix_produces_shared_blobs() {
        // Two streams that share a long tail must converge on the same
        // split points within the shared region.
        let tail: Vec<u8> = (0..150_000u32).map(|i| (i.wrapping_mul(48271) >> 16) as u8).collect();
        let mut a = b"prefix-a".to_vec();
        a.extend_from_slice(&tail);
        let mut b = b"a completely different and longer prefix".to_vec();
        b.extend_from_slice(&tail);

        let blobs_a: Vec<Vec<u8>> = split_all(&a, 13).into_iter().map(|(b, _)| b).collect();
        let blobs_b: Vec<Vec<u8>> = split_all(&b, 13).into_iter().map(|(b, _)| b).collect();

        let set_a: std::collections::HashSet<Vec<u8>> = blobs_a.into_iter().collect();
        let shared = blobs_b.iter().filter(|blob| set_a.contains(*blob)).count();
        assert!(shared > 0, "no blobs shared between streams with a common tail");
    }

    #[test]
    fn record_splitter_is_deterministic() {
        let records: Vec<Vec<u8>> = (0..2000u32)
            .map(|i| format!("entry-{i:08}").into_bytes())
            .collect();
        let run = |bits| {
            let mut s = RollsumRecordSplitter::new(bits);
            records
                .iter()
                .map(|r| s.feed(r))
                .collect::<Vec<Option<u32>>>()
        };
        assert_eq!(run(5), run(5));
        let splits = run(5).iter().filter(|o| o.is_some()).count();
        assert!(splits > 0, "expected some record boundaries at bits=5");
    }
}
