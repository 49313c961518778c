use crate::{line_of, parse_field, tsv_reader, SwarmIndex};
use anyhow::{anyhow, bail, Result};
use csv::StringRecord;
use log::{debug, info, warn};
use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

/// One carved sub-cluster: the amplicon it grew from and every member
/// assigned to it. Members are unordered here; the finalizer sorts them.
#[derive(Debug)]
pub struct SubCluster {
    pub root: String,
    pub members: Vec<String>,
}

/// The sub-clusters carved out of one original cluster. `seed` is the
/// cluster's original (global) seed, the father of its first merge.
#[derive(Debug)]
pub struct ClusterForest {
    pub cluster: u64,
    pub seed: String,
    pub subclusters: Vec<SubCluster>,
}

// --------------------------------------------------
/// Replay the merge log (`swarm -i`) and partition every flagged cluster
/// among its sub-cluster roots: the global seed plus each local seed found
/// in that cluster. Records are `father son diffs clusterID step`, grouped
/// by cluster and ordered by step.
///
/// A merge whose son is a local seed opens no edge: the son keeps its own
/// subtree. Every other son joins the sub-cluster holding its father; when
/// the father is unknown (an orphan left by the grafting step), the father
/// joins the sub-cluster holding the son instead. An edge attached to
/// neither side aborts the run.
///
/// Clusters whose first father is not a known global seed are skipped
/// without building anything, and the scan stops at the first cluster
/// boundary after every local seed has been housed. Stopping only at
/// boundaries keeps the last flagged cluster complete.
pub fn carve_subclusters(
    path: &Path,
    local_seeds: &HashSet<String>,
    index: &SwarmIndex,
) -> Result<Vec<ClusterForest>> {
    info!(r#"Parsing merge log "{}""#, path.display());

    // local seeds grouped under the original seed of their cluster
    let mut locals_by_seed: HashMap<&str, Vec<&str>> = HashMap::new();
    for (local, global) in &index.global_seeds {
        locals_by_seed.entry(global).or_default().push(local);
    }
    for locals in locals_by_seed.values_mut() {
        locals.sort_unstable();
    }
    let flagged: HashSet<&str> =
        index.global_seeds.values().map(String::as_str).collect();

    let mut forests = vec![];
    let mut open: Option<OpenForest> = None;
    let mut current: Option<u64> = None;
    let mut remaining = index.global_seeds.len();

    let mut reader = tsv_reader(path)?;
    let mut record = StringRecord::new();
    while reader
        .read_record(&mut record)
        .map_err(|e| anyhow!("Cannot parse {}: {e}", path.display()))?
    {
        if record.len() != 5 {
            bail!(
                "Expected 5 tab-separated fields on line {} of {}, found {}",
                line_of(&record),
                path.display(),
                record.len()
            );
        }
        let cluster: u64 = parse_field(&record, 3, "cluster id", path)?;

        if current != Some(cluster) {
            if let Some(forest) = open.take() {
                forests.push(forest.close());
            }
            // Every local seed is housed, and a cluster hosting none of
            // them cannot be flagged: the rest of the log is irrelevant.
            if remaining == 0 {
                debug!("all local seeds housed, stopping at cluster {cluster}");
                break;
            }
            current = Some(cluster);
            let seed = &record[0]; // father of the first merge
            if flagged.contains(seed) {
                let mut forest = OpenForest::new(cluster, seed);
                if let Some(locals) = locals_by_seed.get(seed) {
                    for local in locals {
                        forest.root(local);
                        // a cluster block that reappears later in the log
                        // must not drive the count below zero
                        remaining = remaining.saturating_sub(1);
                    }
                }
                open = Some(forest);
            }
        }

        if let Some(forest) = open.as_mut() {
            let (father, son) = (&record[0], &record[1]);
            if local_seeds.contains(son) {
                // A local seed starts its own sub-cluster rather than
                // inheriting the father's subtree.
                forest.root(son);
            } else if !forest.attach(father, son) {
                bail!(
                    "Cannot attach merge (father {father}, son {son}) of \
                     cluster {cluster} on line {} of {}",
                    line_of(&record),
                    path.display()
                );
            }
        }
    }

    if let Some(forest) = open.take() {
        forests.push(forest.close());
    }
    if remaining > 0 {
        warn!("{remaining} local seed(s) never appeared in the merge log");
    }

    Ok(forests)
}

// --------------------------------------------------
#[derive(Debug)]
struct OpenForest {
    cluster: u64,
    seed: String,
    roots: Vec<String>,
    // amplicon -> position in `roots`
    members: HashMap<String, usize>,
}

impl OpenForest {
    fn new(cluster: u64, seed: &str) -> Self {
        let mut forest = OpenForest {
            cluster,
            seed: seed.to_string(),
            roots: vec![],
            members: HashMap::new(),
        };
        forest.root(seed);
        forest
    }

    fn root(&mut self, amplicon: &str) {
        if !self.members.contains_key(amplicon) {
            self.members.insert(amplicon.to_string(), self.roots.len());
            self.roots.push(amplicon.to_string());
        }
    }

    fn attach(&mut self, father: &str, son: &str) -> bool {
        if let Some(&i) = self.members.get(father) {
            self.members.entry(son.to_string()).or_insert(i);
            true
        } else if let Some(&i) = self.members.get(son) {
            // The father is an orphan left over from grafting: hang it
            // under the sub-cluster its son already belongs to.
            debug!(
                "orphan father {father} rejoins cluster {} through son {son}",
                self.cluster
            );
            self.members.entry(father.to_string()).or_insert(i);
            true
        } else {
            false
        }
    }

    fn close(self) -> ClusterForest {
        let mut members: Vec<Vec<String>> =
            self.roots.iter().map(|_| vec![]).collect();
        for (amplicon, i) in self.members {
            members[i].push(amplicon);
        }
        let subclusters = self
            .roots
            .into_iter()
            .zip(members)
            .map(|(root, members)| SubCluster { root, members })
            .collect();

        ClusterForest {
            cluster: self.cluster,
            seed: self.seed,
            subclusters,
        }
    }
}
