// Cross-process lock smoke test for in-place dump patching.
use std::process::Command;

use poolprobe::api::{Memory, Segment, SnapshotMemory};

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_poolprobe");
    Command::new(exe)
}

#[test]
fn in_place_release_is_busy_while_dump_is_mapped() {
    let temp = tempfile::tempdir().expect("tempdir");
    let header = temp.path().join("header.bin");
    let block = temp.path().join("block.bin");
    let mut header_bytes = vec![0u8; 0x40];
    header_bytes[8..16].copy_from_slice(&0x1000u64.to_le_bytes());
    header_bytes[40..48].copy_from_slice(&4u64.to_le_bytes());
    std::fs::write(&header, header_bytes).expect("header");
    std::fs::write(&block, vec![0u8; 16 + 4 * 80]).expect("block");

    let held = SnapshotMemory::new()
        .with_segment(Segment::map_file(0x1000, &block).expect("map"))
        .expect("segment");

    let segment_args = [
        "--segment".to_string(),
        format!("0x100={}", header.display()),
        "--segment".to_string(),
        format!("0x1000={}", block.display()),
    ];
    let busy = cmd()
        .args(["release", "--in-place"])
        .args(&segment_args)
        .args(["0x100", "2"])
        .output()
        .expect("release");
    assert_eq!(busy.status.code(), Some(7));
    let stderr = String::from_utf8_lossy(&busy.stderr);
    let last = stderr.lines().last().expect("error line");
    let err: serde_json::Value = serde_json::from_str(last).expect("error json");
    assert_eq!(err["error"]["kind"], "Busy");
    assert_eq!(held.read_u32(0x1000 + 16 + 160 + 12).expect("word"), 0);

    drop(held);
    let ok = cmd()
        .args(["release", "--in-place"])
        .args(&segment_args)
        .args(["0x100", "2"])
        .output()
        .expect("release");
    assert!(ok.status.success(), "{}", String::from_utf8_lossy(&ok.stderr));
    let bytes = std::fs::read(&block).expect("block");
    let offset = 16 + 160 + 12;
    assert_eq!(u32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("word")), 1);
}
