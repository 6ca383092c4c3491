//! Post-processing of labeling output
//!
//! Neither function is part of labeling itself; both take a finished
//! [`LabelingResult`] and return a relabeled copy.

use super::{LabelInfo, LabelingResult};

/// Renumber labels by descending volume; equal volumes keep their order
pub fn sort_by_volume(result: &LabelingResult) -> LabelingResult {
    let mut order: Vec<usize> = (0..result.labels.len()).collect();
    order.sort_by(|&a, &b| result.labels[b].volume.cmp(&result.labels[a].volume));

    let mut remap = [0u8; 256];
    for (rank, &old) in order.iter().enumerate() {
        remap[old + 1] = (rank + 1) as u8;
    }
    LabelingResult {
        label_map: result.label_map.iter().map(|&l| remap[l as usize]).collect(),
        label_count: result.label_count,
        labels: order.iter().map(|&old| result.labels[old]).collect(),
    }
}

/// Keep the `k` largest components and merge the rest into label `k + 1`.
///
/// Labels are sorted by volume first. The remainder label carries the
/// union of the merged bounding boxes and the sum of their volumes. With
/// `k` at or above the label count the result is only sorted.
pub fn coalesce_top(result: &LabelingResult, k: usize) -> LabelingResult {
    let sorted = sort_by_volume(result);
    if sorted.label_count <= k {
        return sorted;
    }
    let remainder = sorted.labels[k + 1..]
        .iter()
        .fold(sorted.labels[k], |acc: LabelInfo, info| acc.merged(info));
    let mut labels = sorted.labels[..k].to_vec();
    labels.push(remainder);

    let cap = (k + 1) as u8;
    LabelingResult {
        label_map: sorted.label_map.iter().map(|&l| l.min(cap)).collect(),
        label_count: labels.len(),
        labels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labeling::{label_components, Connectivity};

    /// Components of volume 1, 3 and 2 in scan order
    fn sample() -> LabelingResult {
        let rows = ["#.###", ".....", "##..."];
        let mask: Vec<u8> = rows
            .iter()
            .flat_map(|row| row.bytes().map(|b| (b == b'#') as u8))
            .collect();
        label_components(&mask, [5, 3, 1], Connectivity::Four).unwrap()
    }

    #[test]
    fn test_sort_by_volume() {
        let result = sample();
        let volumes: Vec<usize> = result.labels.iter().map(|l| l.volume).collect();
        assert_eq!(volumes, vec![1, 3, 2]);

        let sorted = sort_by_volume(&result);
        let volumes: Vec<usize> = sorted.labels.iter().map(|l| l.volume).collect();
        assert_eq!(volumes, vec![3, 2, 1]);
        assert_eq!(sorted.label_map[0], 3);
        assert_eq!(sorted.label_map[2], 1);
        assert_eq!(sorted.label_map[10], 2);
        assert_eq!(sorted.label_map[1], 0);
    }

    #[test]
    fn test_coalesce_top() {
        let coalesced = coalesce_top(&sample(), 1);
        assert_eq!(coalesced.label_count, 2);
        assert_eq!(coalesced.labels[0].volume, 3);
        let remainder = coalesced.labels[1];
        assert_eq!(remainder.volume, 3);
        assert_eq!(remainder.bounding_box_min, [0, 0, 0]);
        assert_eq!(remainder.bounding_box_max, [1, 2, 0]);
        assert_eq!(coalesced.label_map[0], 2);
        assert_eq!(coalesced.label_map[11], 2);
        assert_eq!(coalesced.label_map[3], 1);
    }

    #[test]
    fn test_coalesce_beyond_count_only_sorts() {
        let result = sample();
        assert_eq!(coalesce_top(&result, 3), sort_by_volume(&result));
        assert_eq!(coalesce_top(&result, 10).label_count, 3);
    }
}
