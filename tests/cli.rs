use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use std::{fs, path::Path};
use tempfile::tempdir;

const PRG: &str = "cleaver";

// --------------------------------------------------
#[test]
fn usage() -> Result<()> {
    for flag in &["-h", "--help"] {
        Command::cargo_bin(PRG)?
            .arg(flag)
            .assert()
            .stdout(predicate::str::contains("Usage"));
    }
    Ok(())
}

// --------------------------------------------------
#[test]
fn dies_no_args() -> Result<()> {
    Command::cargo_bin(PRG)?
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
    Ok(())
}

// --------------------------------------------------
#[test]
fn dies_bad_file() -> Result<()> {
    Command::cargo_bin(PRG)?
        .args([
            "--global-stats",
            "tests/inputs/pond.stats",
            "--per-sample-stats",
            "blargh",
            "--fasta",
            "tests/inputs/pond.fas",
            "--struct",
            "tests/inputs/pond.struct",
            "--swarms",
            "tests/inputs/pond.swarms",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("blargh"));
    Ok(())
}

// --------------------------------------------------
#[test]
fn run_pond() -> Result<()> {
    // outputs land next to the inputs, so work on copies
    let dir = tempdir()?;
    for filename in [
        "pond_per_sample.stats",
        "pond.stats",
        "pond.swarms",
        "pond.struct",
        "pond.fas",
    ] {
        fs::copy(
            Path::new("tests/inputs").join(filename),
            dir.path().join(filename),
        )?;
    }

    let global_stats = dir.path().join("pond.stats");
    let per_sample_stats = dir.path().join("pond_per_sample.stats");
    let fasta = dir.path().join("pond.fas");
    let struct_file = dir.path().join("pond.struct");
    let swarms = dir.path().join("pond.swarms");

    let args = vec![
        "--global-stats",
        global_stats.to_str().unwrap(),
        "--per-sample-stats",
        per_sample_stats.to_str().unwrap(),
        "--fasta",
        fasta.to_str().unwrap(),
        "--struct",
        struct_file.to_str().unwrap(),
        "--swarms",
        swarms.to_str().unwrap(),
        "--log",
        "info",
    ];

    let output = Command::cargo_bin(PRG)?.args(args).output().unwrap();
    dbg!(&output);
    assert!(output.status.success());

    // the singleton cluster "99dd99dd99" hosts a local seed but has no
    // merges, so the run must warn about it and move on
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("never appeared in the merge log"));

    for (created, expected) in [
        ("pond.stats2", "tests/outputs/pond.stats2"),
        ("pond.swarms2", "tests/outputs/pond.swarms2"),
        (
            "pond_1_representatives.fas2",
            "tests/outputs/pond_1_representatives.fas2",
        ),
    ] {
        let actual = fs::read_to_string(dir.path().join(created))?;
        let expected = fs::read_to_string(expected)?;
        assert_eq!(actual, expected);
    }

    Ok(())
}

// --------------------------------------------------
#[test]
fn run_pond_fastidious() -> Result<()> {
    // the "_1f." marker on the swarms and merge log renames the
    // representatives file, nothing else
    let dir = tempdir()?;
    for (source, target) in [
        ("pond_per_sample.stats", "pond_per_sample.stats"),
        ("pond.stats", "pond.stats"),
        ("pond.swarms", "pond_1f.swarms"),
        ("pond.struct", "pond_1f.struct"),
        ("pond.fas", "pond.fas"),
    ] {
        fs::copy(
            Path::new("tests/inputs").join(source),
            dir.path().join(target),
        )?;
    }

    let global_stats = dir.path().join("pond.stats");
    let per_sample_stats = dir.path().join("pond_per_sample.stats");
    let fasta = dir.path().join("pond.fas");
    let struct_file = dir.path().join("pond_1f.struct");
    let swarms = dir.path().join("pond_1f.swarms");

    let args = vec![
        "--global-stats",
        global_stats.to_str().unwrap(),
        "--per-sample-stats",
        per_sample_stats.to_str().unwrap(),
        "--fasta",
        fasta.to_str().unwrap(),
        "--struct",
        struct_file.to_str().unwrap(),
        "--swarms",
        swarms.to_str().unwrap(),
    ];

    let output = Command::cargo_bin(PRG)?.args(args).output().unwrap();
    assert!(output.status.success());

    for (created, expected) in [
        ("pond.stats2", "tests/outputs/pond.stats2"),
        ("pond_1f.swarms2", "tests/outputs/pond.swarms2"),
        (
            "pond_1f_representatives.fas2",
            "tests/outputs/pond_1_representatives.fas2",
        ),
    ] {
        let actual = fs::read_to_string(dir.path().join(created))?;
        let expected = fs::read_to_string(expected)?;
        assert_eq!(actual, expected);
    }

    Ok(())
}
