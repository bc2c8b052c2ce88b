//! Purpose: Parse `--segment <base>=<path>` arguments and assemble dump memory.
//! Exports: `SegmentSpec`, `parse_address`, `load_snapshot`.
//! Role: Bridges CLI strings to `SnapshotMemory` for the offline commands.
//! Invariants: Read-only commands copy files into memory; `--in-place` maps them
//! writable under an exclusive lock so two invocations cannot interleave writes.
use std::path::PathBuf;
use std::str::FromStr;

use poolprobe::api::{Error, ErrorKind, Segment, SnapshotMemory, hexint};
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentSpec {
    pub base: u64,
    pub path: PathBuf,
}

impl FromStr for SegmentSpec {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (base, path) = input
            .split_once('=')
            .ok_or_else(|| format!("expected <base>=<path>, got {input:?}"))?;
        let base = hexint::parse(base).ok_or_else(|| format!("invalid base address {base:?}"))?;
        if path.is_empty() {
            return Err("segment path is empty".to_string());
        }
        Ok(Self {
            base,
            path: PathBuf::from(path),
        })
    }
}

/// Parses a `0x`-prefixed hex or decimal address argument.
pub fn parse_address(input: &str) -> Result<u64, String> {
    hexint::parse(input).ok_or_else(|| format!("invalid address {input:?}"))
}

pub fn load_snapshot(specs: &[SegmentSpec], in_place: bool) -> Result<SnapshotMemory, Error> {
    if specs.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("no memory segments given")
            .with_hint("Pass at least one --segment <base>=<path>."));
    }
    let mut memory = SnapshotMemory::new();
    for spec in specs {
        let segment = if in_place {
            Segment::map_file(spec.base, &spec.path).inspect_err(|err| {
                if err.kind() == ErrorKind::Busy {
                    warn!(path = %spec.path.display(), "dump file is locked by another process");
                }
            })?
        } else {
            Segment::read_file(spec.base, &spec.path)?
        };
        memory.insert(segment)?;
    }
    Ok(memory)
}

#[cfg(test)]
mod tests {
    use super::{SegmentSpec, load_snapshot, parse_address};
    use poolprobe::api::{ErrorKind, Memory};

    #[test]
    fn segment_spec_parses_hex_and_decimal_bases() {
        let spec: SegmentSpec = "0x1000=dump/block0.bin".parse().expect("spec");
        assert_eq!(spec.base, 0x1000);
        assert_eq!(spec.path.to_str(), Some("dump/block0.bin"));
        let spec: SegmentSpec = "4096=a=b.bin".parse().expect("spec");
        assert_eq!(spec.base, 4096);
        assert_eq!(spec.path.to_str(), Some("a=b.bin"));
    }

    #[test]
    fn segment_spec_rejects_malformed_input() {
        assert!("0x1000".parse::<SegmentSpec>().is_err());
        assert!("zz=file".parse::<SegmentSpec>().is_err());
        assert!("0x10=".parse::<SegmentSpec>().is_err());
        assert!(parse_address("0xfg").is_err());
        assert_eq!(parse_address("0x1_0000"), Ok(0x10000));
    }

    #[test]
    fn load_snapshot_reads_files_at_their_bases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seg.bin");
        std::fs::write(&path, 0xfeed_u64.to_le_bytes()).expect("write");
        let specs = vec![SegmentSpec {
            base: 0x2000,
            path: path.clone(),
        }];
        let memory = load_snapshot(&specs, false).expect("load");
        assert_eq!(memory.read_u64(0x2000).expect("read"), 0xfeed);

        let err = load_snapshot(&[], false).expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
