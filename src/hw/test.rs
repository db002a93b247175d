use std::fs::{self, File};
use std::path::PathBuf;
use std::{env, process};

use super::{parse_cpu_list, Hardware, MsrHardware};
use crate::ffi::msr::{IBS_FETCH_CTL, IBS_OP_CTL};

#[test]
fn test_parse_cpu_list() {
    assert_eq!(parse_cpu_list("0-3\n").unwrap(), [0, 1, 2, 3]);
    assert_eq!(parse_cpu_list("0,2,4-5").unwrap(), [0, 2, 4, 5]);
    assert_eq!(parse_cpu_list("7").unwrap(), [7]);
    assert!(parse_cpu_list("").unwrap().is_empty());
}

#[test]
fn test_parse_cpu_list_invalid() {
    assert!(parse_cpu_list("3-1").is_err());
    assert!(parse_cpu_list("a-b").is_err());
    assert!(parse_cpu_list("0,x").is_err());
}

fn scratch_root(name: &str) -> PathBuf {
    let root = env::temp_dir().join(format!("ibs-sample-{}-{}", name, process::id()));
    fs::create_dir_all(root.join("0")).unwrap();
    File::create(root.join("0/msr")).unwrap();
    root
}

#[test]
fn test_msr_prepared_core_keeps_device_open() {
    let root = scratch_root("prepared");
    let hw = MsrHardware::with_root(&root);
    hw.prepare_core(0).unwrap();
    hw.write_msr(0, IBS_OP_CTL, 0x21000).unwrap();

    // Served from the open device, the path is never looked up again.
    fs::remove_file(root.join("0/msr")).unwrap();
    assert_eq!(hw.read_msr(0, IBS_OP_CTL).unwrap(), 0x21000);

    hw.release_core(0);
    assert!(hw.read_msr(0, IBS_OP_CTL).is_err());
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_msr_unprepared_core() {
    let root = scratch_root("unprepared");
    let hw = MsrHardware::with_root(&root);
    hw.write_msr(0, IBS_FETCH_CTL, 7).unwrap();
    assert_eq!(hw.read_msr(0, IBS_FETCH_CTL).unwrap(), 7);
    assert!(hw.prepare_core(1).is_err());
    assert!(hw.read_msr(1, IBS_FETCH_CTL).is_err());
    fs::remove_dir_all(&root).unwrap();
}
