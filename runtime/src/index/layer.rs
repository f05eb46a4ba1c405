//! Streaming parse of one gzip tar layer.
//!
//! Entries are merged into the overlay as they are read; file payloads are
//! skipped, never retained.

use std::io::{self, BufRead, Read};

use strata_core::checkpoint::{Checkpoint, CheckpointTable};
use strata_core::config::IndexConfig;
use strata_core::error::{Result, StrataError};
use strata_core::index::normalize_path;
use strata_core::node::{NodeKind, Timestamp};
use tar::{Archive, EntryType};

use super::counting::{Boundaries, MemberDecoder};
use super::overlay::{LayerEntry, OverlayIndex};

/// Outcome of indexing one layer.
#[derive(Debug, Clone)]
pub(crate) struct LayerSummary {
    pub checkpoints: CheckpointTable,
    pub entries: usize,
    pub uncompressed_size: u64,
}

/// Applies the checkpoint policy to the member boundaries of a layer.
///
/// Only member boundaries are recorded, so every checkpoint is a point
/// where a fresh decoder can start. The interval and large-file rules pick
/// among those boundaries; an ordinary single-member layer has none inside
/// it, and its table is always `[(0, 0), (compressed_len, uncompressed_len)]`.
struct CheckpointRecorder {
    table: CheckpointTable,
    boundaries: Boundaries,
    latest: Option<Checkpoint>,
    interval: u64,
    large_file_threshold: u64,
}

impl CheckpointRecorder {
    fn new(boundaries: Boundaries, config: &IndexConfig) -> Self {
        Self {
            table: CheckpointTable::new(),
            boundaries,
            latest: None,
            interval: config.checkpoint_interval,
            large_file_threshold: config.large_file_threshold,
        }
    }

    /// Take newly discovered boundaries, keeping those one interval apart.
    fn observe(&mut self) {
        let discovered: Vec<Checkpoint> = self.boundaries.lock().drain(..).collect();
        for boundary in discovered {
            self.latest = Some(boundary);
            let last = self.table.last().map_or(0, |c| c.uncompressed_offset);
            if boundary.uncompressed_offset.saturating_sub(last) >= self.interval {
                self.table.push(boundary);
            }
        }
    }

    /// Called before each entry is merged.
    fn before_entry(&mut self, size: u64) {
        self.observe();
        if size >= self.large_file_threshold {
            if let Some(boundary) = self.latest {
                if self.table.push(boundary) {
                    tracing::trace!(
                        compressed = boundary.compressed_offset,
                        uncompressed = boundary.uncompressed_offset,
                        "Checkpoint before large entry"
                    );
                }
            }
        }
    }

    /// Record the end-of-layer checkpoint.
    fn finish(mut self) -> CheckpointTable {
        self.observe();
        if let Some(boundary) = self.latest {
            self.table.push(boundary);
        }
        self.table
    }
}

/// Parse a compressed layer stream and merge its entries.
pub(crate) fn index_layer<R: BufRead>(
    reader: R,
    position: usize,
    digest: &str,
    overlay: &mut OverlayIndex,
    config: &IndexConfig,
) -> Result<LayerSummary> {
    let corrupt = |e: io::Error| {
        StrataError::IndexCorrupt(format!("layer {}: {}", digest, e))
    };

    let boundaries = Boundaries::default();
    let mut recorder = CheckpointRecorder::new(boundaries.clone(), config);
    let mut archive = Archive::new(MemberDecoder::new(reader, boundaries));
    let mut count = 0;

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let Some(parsed) = parse_entry(&mut entry).map_err(corrupt)? else {
            continue;
        };

        recorder.before_entry(parsed.size);
        overlay.apply(position, digest, parsed)?;
        count += 1;
    }

    // Drain tar padding so the final member boundary is seen
    let mut decoder = archive.into_inner();
    io::copy(&mut decoder, &mut io::sink()).map_err(corrupt)?;
    let uncompressed_size = decoder.produced();

    let checkpoints = recorder.finish();
    tracing::debug!(
        digest = %digest,
        entries = count,
        checkpoints = checkpoints.len(),
        uncompressed_size,
        "Parsed layer"
    );

    Ok(LayerSummary {
        checkpoints,
        entries: count,
        uncompressed_size,
    })
}

fn parse_entry<R: Read>(entry: &mut tar::Entry<'_, R>) -> io::Result<Option<LayerEntry>> {
    let header = entry.header();
    let kind = match header.entry_type() {
        EntryType::Regular | EntryType::Continuous => NodeKind::RegularFile,
        EntryType::Directory => NodeKind::Directory,
        EntryType::Symlink => NodeKind::Symlink,
        EntryType::Link => NodeKind::HardLink,
        other => {
            tracing::trace!(entry_type = ?other, "Skipping unsupported tar entry");
            return Ok(None);
        }
    };

    let path = normalize_path(&entry.path()?.to_string_lossy());
    let link_target = match kind {
        NodeKind::Symlink | NodeKind::HardLink => entry
            .link_name()?
            .map(|target| target.to_string_lossy().into_owned()),
        _ => None,
    };

    let header = entry.header();
    let old = header.as_old();
    let mode = numeric_field(&old.mode, || header.mode().map(u64::from))? as u32;
    let uid = numeric_field(&old.uid, || header.uid())? as u32;
    let gid = numeric_field(&old.gid, || header.gid())? as u32;
    let size = if kind == NodeKind::RegularFile {
        entry.size()
    } else {
        0
    };
    let mtime_secs = numeric_field(&old.mtime, || header.mtime())? as i64;
    let (gnu_atime, gnu_ctime) = match header.as_gnu() {
        Some(gnu) => (gnu.atime().ok(), gnu.ctime().ok()),
        None => (None, None),
    };
    let offset = entry.raw_file_position();

    let mut mtime = Timestamp::new(mtime_secs, 0);
    let mut atime = gnu_atime.filter(|t| *t > 0).map(|t| Timestamp::new(t as i64, 0));
    let mut ctime = gnu_ctime.filter(|t| *t > 0).map(|t| Timestamp::new(t as i64, 0));

    if let Some(extensions) = entry.pax_extensions()? {
        for extension in extensions {
            let extension = extension?;
            let (Ok(key), Ok(value)) = (extension.key(), extension.value()) else {
                continue;
            };
            match key {
                "mtime" => mtime = Timestamp::from_pax(value).unwrap_or(mtime),
                "atime" => atime = Timestamp::from_pax(value).or(atime),
                "ctime" => ctime = Timestamp::from_pax(value).or(ctime),
                _ => {}
            }
        }
    }

    Ok(Some(LayerEntry {
        path,
        kind,
        mode,
        uid,
        gid,
        atime: atime.unwrap_or(mtime),
        mtime,
        ctime: ctime.unwrap_or(mtime),
        offset,
        size,
        link_target,
    }))
}

/// A numeric header field left blank (all NUL or all space) reads as zero.
fn numeric_field(raw: &[u8], parse: impl FnOnce() -> io::Result<u64>) -> io::Result<u64> {
    if raw.iter().all(|b| *b == 0 || *b == b' ') {
        return Ok(0);
    }
    parse()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    /// Entry for test layers: (path, kind, payload or link target).
    pub(crate) enum TestEntry<'a> {
        File(&'a str, &'a [u8]),
        Dir(&'a str),
        Symlink(&'a str, &'a str),
        HardLink(&'a str, &'a str),
    }

    fn append(builder: &mut tar::Builder<Vec<u8>>, entry: &TestEntry<'_>) {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(1_700_000_000);
        header.set_uid(0);
        header.set_gid(0);
        match entry {
            TestEntry::File(path, data) => {
                header.set_entry_type(EntryType::Regular);
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, path, *data).unwrap();
            }
            TestEntry::Dir(path) => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                header.set_mode(0o755);
                header.set_cksum();
                builder.append_data(&mut header, path, io::empty()).unwrap();
            }
            TestEntry::Symlink(path, target) => {
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o777);
                builder.append_link(&mut header, path, target).unwrap();
            }
            TestEntry::HardLink(path, target) => {
                header.set_entry_type(EntryType::Link);
                header.set_size(0);
                header.set_mode(0o644);
                builder.append_link(&mut header, path, target).unwrap();
            }
        }
    }

    /// Uncompressed tar bytes for the given groups of entries, one chunk per group.
    fn tar_chunks(groups: &[&[TestEntry<'_>]]) -> Vec<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut chunks = Vec::new();
        let mut emitted = 0;
        for group in groups {
            for entry in group.iter() {
                append(&mut builder, entry);
            }
            let len = builder.get_ref().len();
            chunks.push(builder.get_ref()[emitted..len].to_vec());
            emitted = len;
        }
        let all = builder.into_inner().unwrap();
        if let Some(last) = chunks.last_mut() {
            last.extend_from_slice(&all[emitted..]);
        }
        chunks
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    /// A gzip tar layer with a single member.
    pub(crate) fn build_layer(entries: &[TestEntry<'_>]) -> Vec<u8> {
        build_multi_member_layer(&[entries])
    }

    /// A gzip tar layer with one gzip member per entry group.
    pub(crate) fn build_multi_member_layer(groups: &[&[TestEntry<'_>]]) -> Vec<u8> {
        tar_chunks(groups).iter().flat_map(|chunk| gzip(chunk)).collect()
    }

    /// The decompressed tar stream of a layer.
    pub(crate) fn decompress(layer: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        flate2::read::MultiGzDecoder::new(layer)
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn config(interval: u64, threshold: u64) -> IndexConfig {
        IndexConfig {
            checkpoint_interval: interval,
            large_file_threshold: threshold,
            skip_runtime_dirs: true,
        }
    }

    const DIGEST: &str = "sha256:test";

    #[test]
    fn test_index_layer_offsets_point_at_content() {
        let layer = build_layer(&[
            TestEntry::Dir("etc/"),
            TestEntry::File("etc/hostname", b"strata\n"),
            TestEntry::File("etc/motd", b"welcome"),
            TestEntry::Symlink("etc/localtime", "/usr/share/zoneinfo/UTC"),
        ]);
        let mut overlay = OverlayIndex::new(DIGEST, true);
        let summary = index_layer(&layer[..], 0, DIGEST, &mut overlay, &IndexConfig::default()).unwrap();
        assert_eq!(summary.entries, 4);

        let tar = decompress(&layer);
        assert_eq!(summary.uncompressed_size, tar.len() as u64);

        let index = overlay.finish();
        for (path, expected) in [("/etc/hostname", &b"strata\n"[..]), ("/etc/motd", b"welcome")] {
            let remote = index.get(path).unwrap().content.as_remote().unwrap().clone();
            let start = remote.offset as usize;
            assert_eq!(&tar[start..start + remote.length as usize], expected);
        }

        let link = index.get("/etc/localtime").unwrap();
        assert_eq!(link.kind, NodeKind::Symlink);
        assert_eq!(link.link_target.as_deref(), Some("/usr/share/zoneinfo/UTC"));
        assert_eq!(index.get("/etc/motd").unwrap().attr.mtime.secs, 1_700_000_000);
    }

    #[test]
    fn test_single_member_checkpoints() {
        let layer = build_layer(&[TestEntry::File("a", b"hello")]);
        let mut overlay = OverlayIndex::new(DIGEST, true);
        let summary = index_layer(&layer[..], 0, DIGEST, &mut overlay, &config(1, 1)).unwrap();

        let entries = summary.checkpoints.entries();
        assert_eq!(entries[0], Checkpoint::ORIGIN);
        assert_eq!(
            *entries.last().unwrap(),
            Checkpoint::new(layer.len() as u64, summary.uncompressed_size)
        );
    }

    #[test]
    fn test_large_file_gets_checkpoint() {
        let big = vec![7u8; 64 * 1024];
        let first: &[TestEntry] = &[TestEntry::File("small", b"12345")];
        let second: &[TestEntry] = &[TestEntry::File("big", &big)];
        let layer = build_multi_member_layer(&[first, second]);

        let mut overlay = OverlayIndex::new(DIGEST, true);
        let summary =
            index_layer(&layer[..], 0, DIGEST, &mut overlay, &config(u64::MAX, 32 * 1024)).unwrap();
        let entries = summary.checkpoints.entries();
        assert_eq!(entries.len(), 3);

        // The checkpoint sits at or before the big file's data
        let big_offset = overlay_offset(overlay, "/big");
        let before = summary.checkpoints.nearest(big_offset);
        assert!(before.uncompressed_offset > 0);
        assert!(before.uncompressed_offset <= big_offset);

        // and resuming there decodes the big file
        let mut resumed = Vec::new();
        flate2::read::MultiGzDecoder::new(&layer[before.compressed_offset as usize..])
            .read_to_end(&mut resumed)
            .unwrap();
        let skip = (big_offset - before.uncompressed_offset) as usize;
        assert_eq!(&resumed[skip..skip + big.len()], &big[..]);
    }

    fn overlay_offset(overlay: OverlayIndex, path: &str) -> u64 {
        overlay.finish().get(path).unwrap().content.as_remote().unwrap().offset
    }

    #[test]
    fn test_interval_checkpoints() {
        let a = vec![1u8; 4096];
        let groups: Vec<Vec<TestEntry>> = (0..4)
            .map(|_| vec![TestEntry::File("f", &a[..])])
            .collect();
        let refs: Vec<&[TestEntry]> = groups.iter().map(|g| g.as_slice()).collect();
        let layer = build_multi_member_layer(&refs);

        let mut overlay = OverlayIndex::new(DIGEST, true);
        let summary = index_layer(&layer[..], 0, DIGEST, &mut overlay, &config(8192, u64::MAX)).unwrap();
        let entries = summary.checkpoints.entries();

        // Each member is ~4.5 KiB of tar, so roughly every other boundary is kept
        assert!(entries.len() >= 3);
        for pair in entries.windows(2) {
            assert!(pair[1].compressed_offset >= pair[0].compressed_offset);
            assert!(pair[1].uncompressed_offset >= pair[0].uncompressed_offset);
        }
        for inner in &entries[1..entries.len() - 1] {
            assert!(inner.uncompressed_offset >= 8192);
        }
    }

    #[test]
    fn test_hard_link_in_layer() {
        let layer = build_layer(&[
            TestEntry::File("bin/busybox", b"#!elf"),
            TestEntry::HardLink("bin/sh", "bin/busybox"),
        ]);
        let mut overlay = OverlayIndex::new(DIGEST, true);
        index_layer(&layer[..], 0, DIGEST, &mut overlay, &IndexConfig::default()).unwrap();
        let index = overlay.finish();
        let sh = index.get("/bin/sh").unwrap();
        assert_eq!(sh.kind, NodeKind::HardLink);
        assert_eq!(sh.size(), 5);
    }

    #[test]
    fn test_truncated_layer_is_corrupt() {
        let layer = build_layer(&[TestEntry::File("a", &[0u8; 4096])]);
        let truncated = &layer[..layer.len() / 2];
        let mut overlay = OverlayIndex::new(DIGEST, true);
        let result = index_layer(truncated, 0, DIGEST, &mut overlay, &IndexConfig::default());
        assert!(matches!(result, Err(StrataError::IndexCorrupt(_))));
    }

    #[test]
    fn test_pax_timestamps() {
        let mut builder = tar::Builder::new(Vec::new());
        let pax: [(&str, &[u8]); 2] = [("mtime", b"1700000000.25"), ("atime", b"1700000001.5")];
        builder.append_pax_extensions(pax).unwrap();
        let mut header = tar::Header::new_ustar();
        header.set_size(1);
        header.set_mode(0o600);
        header.set_uid(1000);
        header.set_gid(1000);
        header.set_mtime(1_700_000_000);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append_data(&mut header, "t", &b"x"[..]).unwrap();
        let layer = gzip(&builder.into_inner().unwrap());

        let mut overlay = OverlayIndex::new(DIGEST, true);
        index_layer(&layer[..], 0, DIGEST, &mut overlay, &IndexConfig::default()).unwrap();
        let index = overlay.finish();
        let node = index.get("/t").unwrap();
        assert_eq!(node.attr.mtime, Timestamp::new(1_700_000_000, 250_000_000));
        assert_eq!(node.attr.atime, Timestamp::new(1_700_000_001, 500_000_000));
        assert_eq!(node.attr.ctime, node.attr.mtime);
        assert_eq!(node.attr.mode, 0o600);
        assert_eq!((node.attr.uid, node.attr.gid), (1000, 1000));
    }

    #[test]
    fn test_blank_numeric_fields_read_as_zero() {
        let mut builder = tar::Builder::new(Vec::new());
        // uid, gid, mode and mtime are never set and stay NUL-filled
        let mut header = tar::Header::new_ustar();
        header.set_size(2);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append_data(&mut header, "blank", &b"ok"[..]).unwrap();

        let mut spaced = tar::Header::new_ustar();
        spaced.set_size(0);
        spaced.set_mode(0o755);
        spaced.set_entry_type(EntryType::Directory);
        spaced.as_old_mut().uid = *b"       \0";
        spaced.as_old_mut().gid = *b"        ";
        spaced.set_cksum();
        builder.append_data(&mut spaced, "spaced/", io::empty()).unwrap();
        let layer = gzip(&builder.into_inner().unwrap());

        let mut overlay = OverlayIndex::new(DIGEST, true);
        let summary = index_layer(&layer[..], 0, DIGEST, &mut overlay, &IndexConfig::default()).unwrap();
        assert_eq!(summary.entries, 2);

        let index = overlay.finish();
        let node = index.get("/blank").unwrap();
        assert_eq!((node.attr.uid, node.attr.gid, node.attr.mode), (0, 0, 0));
        assert_eq!(node.attr.mtime, Timestamp::new(0, 0));
        assert_eq!(node.size(), 2);

        let dir = index.get("/spaced").unwrap();
        assert_eq!((dir.attr.uid, dir.attr.gid), (0, 0));
        assert_eq!(dir.attr.mode, 0o755);
    }
}
