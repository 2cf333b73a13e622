//! Result Grouping
//!
//! Partitions successful execution records into clusters by result hash.
//! Failed records stay out of every cluster.

use crate::model::{ExecutionRecord, ResultCluster};
use std::collections::HashMap;

pub struct ResultGrouper;

impl ResultGrouper {
    pub fn new() -> Self {
        Self
    }

    /// Cluster ids follow first-seen order of the hashes
    pub fn group(&self, records: &[ExecutionRecord]) -> Vec<ResultCluster> {
        let mut clusters: Vec<ResultCluster> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();

        for record in records.iter().filter(|r| r.success) {
            match index.get(record.result_hash.as_str()) {
                Some(&i) => {
                    let cluster = &mut clusters[i];
                    if !cluster.members.contains(&record.candidate_id) {
                        cluster.members.push(record.candidate_id.clone());
                        cluster.size += 1;
                    }
                }
                None => {
                    index.insert(record.result_hash.as_str(), clusters.len());
                    clusters.push(ResultCluster {
                        cluster_id: clusters.len(),
                        result_hash: record.result_hash.clone(),
                        members: vec![record.candidate_id.clone()],
                        size: 1,
                    });
                }
            }
        }
        clusters
    }
}

impl Default for ResultGrouper {
    fn default() -> Self {
        Self::new()
    }
}
