//! Lazy download streaming.
//!
//! Segments are content-agnostic: the bytes handed back are deterministic
//! pseudo-random output of an XOF keyed by `node_id:file_id:segment_offset`,
//! so any holder of a segment produces identical bytes at identical offsets.

use bytes::Bytes;

use crate::metadata::{FileManifest, ManifestSegment, PARITY_TIER};

#[derive(Debug, Clone)]
pub struct DownloadChunk {
    pub offset: u64,
    pub data: Bytes,
    pub is_last: bool,
}

pub struct DownloadStream {
    segments: Vec<ManifestSegment>,
    cursor: u64,
    end: u64,
    chunk_size: u64,
    emitted_any: bool,
}

impl DownloadStream {
    /// `offset` must already be validated against the manifest size; a zero
    /// `length` yields a single empty terminal chunk.
    pub fn new(manifest: &FileManifest, offset: u64, length: u64, chunk_size: u64) -> Self {
        let mut segments: Vec<ManifestSegment> = manifest
            .segments
            .iter()
            .filter(|s| s.storage_tier != PARITY_TIER && s.offset < manifest.total_size)
            .cloned()
            .collect();
        segments.sort_by_key(|s| s.offset);
        // Replica copies share an offset; one copy per offset serves reads.
        segments.dedup_by_key(|s| s.offset);
        Self {
            segments,
            cursor: offset,
            end: offset + length,
            chunk_size: chunk_size.max(1),
            emitted_any: false,
        }
    }

    fn segment_bytes(segment: &ManifestSegment, relative_offset: u64, len: usize) -> Bytes {
        let mut hasher = blake3::Hasher::new();
        hasher.update(
            format!("{}:{}:{}", segment.node_id, segment.file_id, segment.offset).as_bytes(),
        );
        let mut reader = hasher.finalize_xof();
        reader.set_position(relative_offset);
        let mut buffer = vec![0u8; len];
        reader.fill(&mut buffer);
        Bytes::from(buffer)
    }
}

impl Iterator for DownloadStream {
    type Item = DownloadChunk;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.end {
            if self.emitted_any {
                return None;
            }
            // Zero remaining bytes: one empty terminal chunk.
            self.emitted_any = true;
            return Some(DownloadChunk {
                offset: self.cursor,
                data: Bytes::new(),
                is_last: true,
            });
        }
        self.emitted_any = true;

        // Find the segment covering the cursor, skipping any hole.
        let segment = self
            .segments
            .iter()
            .find(|s| s.offset + s.length > self.cursor)?
            .clone();
        if self.cursor < segment.offset {
            self.cursor = segment.offset;
            if self.cursor >= self.end {
                return Some(DownloadChunk {
                    offset: self.cursor,
                    data: Bytes::new(),
                    is_last: true,
                });
            }
        }
        let segment_end = segment.offset + segment.length;
        let take = self
            .chunk_size
            .min(self.end - self.cursor)
            .min(segment_end - self.cursor);
        let relative = self.cursor - segment.offset;
        let data = Self::segment_bytes(&segment, relative, take as usize);
        let chunk_offset = self.cursor;
        self.cursor += take;
        let is_last = self.cursor >= self.end
            || !self
                .segments
                .iter()
                .any(|s| s.offset + s.length > self.cursor && s.offset < self.end);
        Some(DownloadChunk {
            offset: chunk_offset,
            data,
            is_last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FileManifest;

    fn segment(node: &str, file: &str, offset: u64, length: u64) -> ManifestSegment {
        ManifestSegment {
            node_id: node.to_string(),
            file_id: file.to_string(),
            offset,
            length,
            checksum: None,
            storage_tier: "hot".to_string(),
            zone: None,
            encrypted: false,
        }
    }

    fn manifest(total: u64, segments: Vec<ManifestSegment>) -> FileManifest {
        FileManifest {
            manifest_id: "m1".to_string(),
            file_id: "f1".to_string(),
            total_size: total,
            segments,
            encryption: None,
            durability: None,
        }
    }

    #[test]
    fn streams_full_length() {
        let m = manifest(1024, vec![segment("n1", "s0", 0, 1024)]);
        let chunks: Vec<_> = DownloadStream::new(&m, 0, 1024, 256).collect();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks.iter().map(|c| c.data.len()).sum::<usize>(), 1024);
        assert!(chunks.last().unwrap().is_last);
        assert_eq!(chunks[1].offset, 256);
    }

    #[test]
    fn partial_range_returns_exact_bytes() {
        let m = manifest(1024, vec![segment("n1", "s0", 0, 1024)]);
        let chunks: Vec<_> = DownloadStream::new(&m, 256, 128, 4096).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data.len(), 128);
        assert_eq!(chunks[0].offset, 256);
        assert!(chunks[0].is_last);
    }

    #[test]
    fn bytes_are_deterministic_and_offset_consistent() {
        let m = manifest(1024, vec![segment("n1", "s0", 0, 1024)]);
        let full: Vec<u8> = DownloadStream::new(&m, 0, 1024, 1024)
            .flat_map(|c| c.data.to_vec())
            .collect();
        let window: Vec<u8> = DownloadStream::new(&m, 100, 50, 50)
            .flat_map(|c| c.data.to_vec())
            .collect();
        assert_eq!(&full[100..150], window.as_slice());

        let again: Vec<u8> = DownloadStream::new(&m, 0, 1024, 1024)
            .flat_map(|c| c.data.to_vec())
            .collect();
        assert_eq!(full, again);
    }

    #[test]
    fn spans_multiple_segments() {
        let m = manifest(
            2048,
            vec![segment("n1", "s0", 0, 1024), segment("n2", "s1", 1024, 1024)],
        );
        let chunks: Vec<_> = DownloadStream::new(&m, 512, 1024, 4096).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].offset, 512);
        assert_eq!(chunks[0].data.len(), 512);
        assert_eq!(chunks[1].offset, 1024);
        assert_eq!(chunks[1].data.len(), 512);
        assert!(chunks[1].is_last);
    }

    #[test]
    fn zero_length_yields_empty_terminal_chunk() {
        let m = manifest(1024, vec![segment("n1", "s0", 0, 1024)]);
        let chunks: Vec<_> = DownloadStream::new(&m, 1024, 0, 256).collect();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].data.is_empty());
        assert!(chunks[0].is_last);
    }

    #[test]
    fn replica_copies_do_not_duplicate_bytes() {
        let mut replica = segment("n2", "s0-copy", 0, 1024);
        replica.storage_tier = "hot".to_string();
        let m = manifest(1024, vec![segment("n1", "s0", 0, 1024), replica]);
        let total: usize = DownloadStream::new(&m, 0, 1024, 256)
            .map(|c| c.data.len())
            .sum();
        assert_eq!(total, 1024);
    }
}
