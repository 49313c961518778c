use anyhow::{anyhow, bail, Result};
use clap::{builder::PossibleValue, Parser, ValueEnum};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use itertools::Itertools;
use kseq::parse_reader;
use log::{debug, info, warn};
use regex::Regex;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

pub mod forest;

use forest::{carve_subclusters, ClusterForest};

/// Break swarm clusters using sample distribution data
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Cluster statistics, sorted by decreasing seed abundance
    #[arg(long, value_name = "STATS")]
    pub global_stats: PathBuf,

    /// Per-sample cluster statistics
    #[arg(long, value_name = "STATS")]
    pub per_sample_stats: PathBuf,

    /// Amplicon sequences, sorted by decreasing abundance
    #[arg(long, value_name = "FASTA")]
    pub fasta: PathBuf,

    /// Internal structure of the clusters (swarm -i)
    #[arg(long = "struct", value_name = "STRUCT")]
    pub struct_file: PathBuf,

    /// List of amplicons per cluster (swarm -o)
    #[arg(long, value_name = "SWARMS")]
    pub swarms: PathBuf,

    /// Fraction of samples a local seed must be seen in
    #[arg(long, value_name = "FRACTION", default_value = "0.05")]
    pub percentage: f64,

    /// Log level
    #[arg(short, long)]
    pub log: Option<LogLevel>,
}

#[derive(Debug, Clone)]
pub enum LogLevel {
    Info,
    Debug,
}

impl ValueEnum for LogLevel {
    fn value_variants<'a>() -> &'a [Self] {
        &[LogLevel::Info, LogLevel::Debug]
    }

    fn to_possible_value<'a>(&self) -> Option<PossibleValue> {
        Some(match self {
            LogLevel::Info => PossibleValue::new("info"),
            LogLevel::Debug => PossibleValue::new("debug"),
        })
    }
}

/// Local seed candidates: amplicons seen as a sample-level seed in at
/// least `threshold` samples.
#[derive(Debug)]
struct LocalSeeds {
    threshold: f64,
    ids: HashSet<String>,
}

/// Index over the swarms that host at least one local seed.
#[derive(Debug, Default)]
pub struct SwarmIndex {
    /// amplicon -> abundance, for every member of a flagged cluster
    pub abundances: HashMap<String, u64>,
    /// local seed -> original seed of the cluster holding it
    pub global_seeds: HashMap<String, String>,
}

/// A finalized sub-cluster: members sorted by decreasing abundance then
/// name, with the first member elected seed.
#[derive(Debug)]
struct Otu {
    seed: String,
    mass: u64,
    singletons: u64,
    members: Vec<(String, u64)>,
}

#[derive(Debug, Serialize)]
struct StatsRecord<'a> {
    uniques: usize,
    mass: u64,
    seed: &'a str,
    seed_abundance: u64,
    singletons: u64,
    // step and layer counts are not recomputed after cleaving
    steps: u8,
    layers: u8,
}

// --------------------------------------------------
pub fn run(args: Args) -> Result<()> {
    env_logger::Builder::new()
        .filter_level(match args.log {
            Some(LogLevel::Debug) => log::LevelFilter::Debug,
            Some(LogLevel::Info) => log::LevelFilter::Info,
            _ => log::LevelFilter::Off,
        })
        .init();

    info!("args = {args:#?}");

    let mut seeds = select_local_seeds(&args.per_sample_stats, args.percentage)?;
    drop_global_seeds(&args.global_stats, &mut seeds)?;

    let index = index_swarms(&args.swarms, &seeds.ids)?;
    let forests = carve_subclusters(&args.struct_file, &seeds.ids, &index)?;
    let cleaved = forests.len();
    let otus = rank_subclusters(forests, &index)?;
    info!("{cleaved} cluster(s) cleaved into {} new clusters", otus.len());

    write_stats(&otus, &updated_path(&args.global_stats))?;
    write_swarms(&otus, &updated_path(&args.swarms))?;
    let representatives =
        representatives_path(&args.fasta, &args.swarms, &args.struct_file);
    write_representatives(&args.fasta, &otus, &representatives)?;

    Ok(())
}

// --------------------------------------------------
fn select_local_seeds(path: &Path, percentage: f64) -> Result<LocalSeeds> {
    info!(r#"Parsing per-sample stats "{}""#, path.display());

    let mut counts: HashMap<String, u64> = HashMap::new();
    let mut number_of_samples: u64 = 0;
    let mut previous_sample: Option<String> = None;

    let mut reader = tsv_reader(path)?;
    let mut record = StringRecord::new();
    while reader
        .read_record(&mut record)
        .map_err(|e| anyhow!("Cannot parse {}: {e}", path.display()))?
    {
        if record.len() < 5 {
            bail!(
                "Expected at least 5 tab-separated fields on line {} of {}, \
                 found {}",
                line_of(&record),
                path.display(),
                record.len()
            );
        }
        counts
            .entry(record[3].to_string())
            .and_modify(|n| *n += 1)
            .or_insert(1);
        // samples are contiguous, so a change of name is a new sample
        let sample = &record[0];
        if previous_sample.as_deref() != Some(sample) {
            previous_sample = Some(sample.to_string());
            number_of_samples += 1;
        }
    }

    // keep only the seeds present in at least `percentage` of the samples
    let threshold = percentage * number_of_samples as f64;
    let ids: HashSet<String> = counts
        .into_iter()
        .filter_map(|(seed, count)| (count as f64 >= threshold).then_some(seed))
        .collect();

    info!(
        "{number_of_samples} sample(s), cleaving threshold = {threshold}, \
         {} local seed candidate(s)",
        ids.len()
    );

    Ok(LocalSeeds { threshold, ids })
}

// --------------------------------------------------
fn drop_global_seeds(path: &Path, seeds: &mut LocalSeeds) -> Result<()> {
    info!(r#"Parsing global stats "{}""#, path.display());

    let mut dropped = 0;
    let mut reader = tsv_reader(path)?;
    let mut record = StringRecord::new();
    while reader
        .read_record(&mut record)
        .map_err(|e| anyhow!("Cannot parse {}: {e}", path.display()))?
    {
        if record.len() < 5 {
            bail!(
                "Expected at least 5 tab-separated fields on line {} of {}, \
                 found {}",
                line_of(&record),
                path.display(),
                record.len()
            );
        }
        let cloud: u64 = parse_field(&record, 0, "cloud size", path)?;
        let mass: u64 = parse_field(&record, 1, "mass", path)?;
        let seed_abundance: u64 =
            parse_field(&record, 3, "seed abundance", path)?;
        let singletons: u64 = parse_field(&record, 4, "singleton count", path)?;

        // The stats are sorted by decreasing seed abundance, and a seed
        // is never less abundant than the number of samples it was seen
        // in: below the threshold no cluster can host a candidate.
        if (seed_abundance as f64) < seeds.threshold {
            break;
        }

        // Only clusters with at least two unique amplicons and enough
        // reads to feed both a global and a secondary seed are worth a
        // look.
        if cloud > 1 && mass as f64 >= 2.0 * seeds.threshold + singletons as f64
        {
            // already a global seed, so not a secondary one
            if seeds.ids.remove(&record[2]) {
                dropped += 1;
            }
        }
    }

    debug!("{dropped} candidate(s) were already global seeds");
    Ok(())
}

// --------------------------------------------------
fn index_swarms(path: &Path, local_seeds: &HashSet<String>) -> Result<SwarmIndex> {
    info!(r#"Parsing swarms "{}""#, path.display());

    // amplicon/abundance pairs come as "id_123" or "id;size=123" tokens
    let separator = Regex::new(r"_|;size=|;? ").unwrap();
    let mut index = SwarmIndex::default();
    let mut remaining = local_seeds.len();

    let file = open(path)?;
    for (number, line) in file.lines().enumerate() {
        if remaining == 0 {
            break;
        }
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = separator.split(line).collect();
        if tokens.len() < 2 || tokens.len() % 2 != 0 {
            bail!(
                "Cannot split line {} of {} into amplicon/abundance pairs",
                number + 1,
                path.display()
            );
        }

        // A cluster is interesting only if it holds a local seed. Its
        // global seed may well not be one: an amplicon abundant in a
        // single sample can outgrow a seed spread across many.
        let common: Vec<&str> = tokens
            .iter()
            .step_by(2)
            .copied()
            .filter(|amplicon| local_seeds.contains(*amplicon))
            .collect();
        if common.is_empty() {
            continue;
        }

        let global_seed = tokens[0];
        for (amplicon, abundance) in tokens.iter().copied().tuples() {
            let abundance: u64 = abundance.parse().map_err(|e| {
                anyhow!(
                    "Invalid abundance for {amplicon} on line {} of {}: {e}",
                    number + 1,
                    path.display()
                )
            })?;
            index.abundances.insert(amplicon.to_string(), abundance);
        }
        for amplicon in common {
            if index
                .global_seeds
                .insert(amplicon.to_string(), global_seed.to_string())
                .is_none()
            {
                remaining -= 1;
            }
        }
    }

    if remaining > 0 {
        warn!(
            "{remaining} local seed(s) have no swarm in {}",
            path.display()
        );
    }

    Ok(index)
}

// --------------------------------------------------
fn rank_subclusters(
    forests: Vec<ClusterForest>,
    index: &SwarmIndex,
) -> Result<Vec<Otu>> {
    info!("Sorting each sub-cluster");

    let mut otus = vec![];
    for forest in forests {
        for sub in forest.subclusters {
            let mut members = Vec::with_capacity(sub.members.len());
            for amplicon in sub.members {
                let abundance = match index.abundances.get(&amplicon) {
                    Some(&abundance) => abundance,
                    _ => bail!(
                        "No abundance on record for {amplicon} \
                         (sub-cluster {} of cluster {})",
                        sub.root,
                        forest.cluster
                    ),
                };
                members.push((amplicon, abundance));
            }
            // Sort by decreasing abundance, then by name: on a tie the
            // smallest name takes the seat, whichever amplicon the
            // sub-cluster grew from.
            members.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

            let seed = members[0].0.clone();
            if seed != sub.root {
                debug!("seed of sub-cluster {} drifted to {seed}", sub.root);
            }
            let mass: u64 = members.iter().map(|(_, abundance)| abundance).sum();
            let singletons = members
                .iter()
                .filter(|(_, abundance)| *abundance == 1)
                .count() as u64;
            otus.push(Otu {
                seed,
                mass,
                singletons,
                members,
            });
        }
    }

    // One order for both the stats and the swarms outputs: heaviest
    // clusters first, larger clouds first, then by seed name.
    otus.sort_by(|a, b| {
        b.mass
            .cmp(&a.mass)
            .then_with(|| b.members.len().cmp(&a.members.len()))
            .then_with(|| a.seed.cmp(&b.seed))
    });

    Ok(otus)
}

// --------------------------------------------------
fn write_stats(otus: &[Otu], outpath: &Path) -> Result<()> {
    info!(r#"Writing per-cluster stats "{}""#, outpath.display());

    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(outpath)
        .map_err(|e| anyhow!("Cannot write {}: {e}", outpath.display()))?;

    for otu in otus {
        writer.serialize(StatsRecord {
            uniques: otu.members.len(),
            mass: otu.mass,
            seed: &otu.seed,
            seed_abundance: otu.members[0].1,
            singletons: otu.singletons,
            steps: 0,
            layers: 0,
        })?;
    }

    writer.flush()?;
    Ok(())
}

// --------------------------------------------------
fn write_swarms(otus: &[Otu], outpath: &Path) -> Result<()> {
    info!(r#"Writing per-cluster swarms "{}""#, outpath.display());

    let mut output = open_for_write(outpath)?;
    for otu in otus {
        let members = otu
            .members
            .iter()
            .map(|(amplicon, abundance)| format!("{amplicon};size={abundance}"))
            .join(" ");
        writeln!(output, "{members}")?;
    }

    output.flush()?;
    Ok(())
}

// --------------------------------------------------
fn write_representatives(
    fasta: &Path,
    otus: &[Otu],
    outpath: &Path,
) -> Result<()> {
    info!(r#"Writing representatives "{}""#, outpath.display());

    let mut output = open_for_write(outpath)?;
    let min_abundance = match otus.iter().map(|otu| otu.members[0].1).min() {
        Some(abundance) => abundance,
        _ => return Ok(()), // nothing was cleaved, leave the file empty
    };

    // Pull out the sequence of every new seed. The FASTA file is sorted
    // by decreasing abundance, so the scan can stop at the first record
    // below the least abundant seed.
    let wanted: HashSet<&str> = otus.iter().map(|otu| otu.seed.as_str()).collect();
    let mut sequences: HashMap<String, String> = HashMap::new();
    let mut reader = parse_reader(open(fasta)?)?;
    while let Some(rec) = reader.iter_record()? {
        let (amplicon, abundance) = split_size_annotation(rec.head())
            .map_err(|e| anyhow!("{e} in {}", fasta.display()))?;
        if abundance < min_abundance {
            break;
        }
        if wanted.contains(amplicon) {
            sequences.insert(amplicon.to_string(), rec.seq().to_string());
        }
    }

    for otu in otus {
        match sequences.get(&otu.seed) {
            Some(sequence) => {
                writeln!(output, ">{};size={}\n{sequence}", otu.seed, otu.mass)?
            }
            _ => bail!("No sequence for seed {} in {}", otu.seed, fasta.display()),
        }
    }

    output.flush()?;
    Ok(())
}

// --------------------------------------------------
fn split_size_annotation(head: &str) -> Result<(&str, u64)> {
    let head = head.trim_end_matches(';');
    match head.split_once(";size=") {
        Some((amplicon, size)) => {
            let abundance = size
                .parse()
                .map_err(|e| anyhow!("Invalid abundance for {amplicon}: {e}"))?;
            Ok((amplicon, abundance))
        }
        _ => bail!("Missing size annotation on {head}"),
    }
}

// --------------------------------------------------
/// "clusters.stats" becomes "clusters.stats2", the naming scheme of the
/// surrounding pipeline.
fn updated_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push("2");
    path.with_file_name(name)
}

// --------------------------------------------------
/// Representatives go next to the input FASTA file, tagged with the swarm
/// parameters: a "_1f." marker in the swarms and merge log names means
/// they come from a fastidious run.
fn representatives_path(
    fasta: &Path,
    swarms: &Path,
    struct_file: &Path,
) -> PathBuf {
    let fastidious = [swarms, struct_file].iter().all(|path| {
        path.file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .contains("_1f.")
    });
    let parameters = if fastidious { "1f" } else { "1" };
    let stem = fasta.file_stem().unwrap_or_default().to_string_lossy();
    fasta.with_file_name(format!("{stem}_{parameters}_representatives.fas2"))
}

// --------------------------------------------------
fn open(filename: &Path) -> Result<Box<dyn BufRead>> {
    Ok(Box::new(BufReader::new(File::open(filename).map_err(
        |e| anyhow!("Cannot read {}: {e}", filename.display()),
    )?)))
}

// --------------------------------------------------
fn open_for_write(filename: &Path) -> Result<Box<dyn Write>> {
    Ok(Box::new(BufWriter::new(File::create(filename).map_err(
        |e| anyhow!("Cannot write {}: {e}", filename.display()),
    )?)))
}

// --------------------------------------------------
pub(crate) fn tsv_reader(path: &Path) -> Result<csv::Reader<File>> {
    ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| anyhow!("Cannot read {}: {e}", path.display()))
}

// --------------------------------------------------
pub(crate) fn line_of(record: &StringRecord) -> u64 {
    record.position().map_or(0, |p| p.line())
}

// --------------------------------------------------
pub(crate) fn parse_field<T: FromStr>(
    record: &StringRecord,
    index: usize,
    name: &str,
    path: &Path,
) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    record[index].parse().map_err(|e| {
        anyhow!(
            "Invalid {name} on line {} of {}: {e}",
            line_of(record),
            path.display()
        )
    })
}
