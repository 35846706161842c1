use crate::commitlog::Index;

/// The highest index stored on a majority of the cluster, counting the leader.
///
/// The leader's own log is always the longest, so it sits at the tail of the sorted matches and
/// only the followers need to be sorted.
pub(super) fn get_cluster_commit_index(mut followers_matched_indexes: Vec<Index>, leader_last_index: Index) -> Index {
    if followers_matched_indexes.is_empty() {
        return leader_last_index;
    }
    followers_matched_indexes.sort();

    // Cluster size is followers + 1, so a majority needs `len / 2` followers besides us, which
    // are the ones from this position onward. Read the unit tests when in doubt.
    let quorum_idx = followers_matched_indexes.len() / 2;

    followers_matched_indexes[quorum_idx].min(leader_last_index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_checker_logic() {
        fn run(expected: u64, matches: Vec<u64>) {
            let matches = matches.into_iter().map(Index::new).collect();

            assert_eq!(Index::new(expected), get_cluster_commit_index(matches, Index::new(9)));
        }

        // 1-cluster
        run(9, vec![]);

        // 3-cluster
        run(0, vec![0, 0]);
        run(9, vec![0, 9]);
        run(9, vec![8, 9]);

        // 4-cluster
        run(0, vec![0, 0, 9]);
        run(8, vec![0, 8, 9]);
        run(8, vec![7, 8, 9]);

        // 5-cluster
        run(0, vec![0, 0, 0, 9]);
        run(8, vec![0, 0, 8, 9]);
        run(8, vec![6, 7, 8, 9]);

        // 6-cluster
        run(0, vec![0, 0, 0, 8, 9]);
        run(7, vec![0, 0, 7, 8, 9]);
        run(7, vec![5, 6, 7, 8, 9]);

        // Ordering doesn't matter
        run(9, vec![9, 8]);
        run(8, vec![7, 9, 8]);
        run(8, vec![6, 0, 8, 9]);
        run(7, vec![9, 8, 0, 0, 7]);
    }

    #[test]
    fn never_beyond_leader_log() {
        assert_eq!(
            Index::new(4),
            get_cluster_commit_index(vec![Index::new(6), Index::new(6)], Index::new(4))
        );
    }
}
