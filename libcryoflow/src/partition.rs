use super::error::PartitionError;
use super::work_list::WorkItem;

/// A contiguous slice of the work list assigned to exactly one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub index: usize,
    pub items: Vec<WorkItem>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Divide the work items into contiguous partitions (one per worker)
///
/// The number of partitions is `min(resource_count, items.len())`, so no worker is ever
/// handed an empty partition. Sizes differ by at most one and earlier partitions receive
/// the extra items, e.g. 10 items over 3 workers gives sizes [4, 3, 3].
pub fn plan_partitions(
    items: &[WorkItem],
    resource_count: usize,
) -> Result<Vec<Partition>, PartitionError> {
    if items.is_empty() {
        return Err(PartitionError::NoWorkItems);
    }
    if resource_count == 0 {
        return Err(PartitionError::NoWorkers);
    }

    let n_partitions = resource_count.min(items.len());
    if n_partitions < resource_count {
        spdlog::info!(
            "Only {} work items for {resource_count} workers, using {n_partitions} workers",
            items.len()
        );
    }
    let base = items.len() / n_partitions;
    let extra = items.len() % n_partitions;

    let mut partitions = Vec::with_capacity(n_partitions);
    let mut start = 0;
    for index in 0..n_partitions {
        let size = base + usize::from(index < extra);
        partitions.push(Partition {
            index,
            items: items[start..start + size].to_vec(),
        });
        start += size;
    }

    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn make_items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem::new(PathBuf::from(format!("mic_{i:03}.mrc"))))
            .collect()
    }

    #[test]
    fn partition_grid_properties() {
        for len in 1..=40 {
            let items = make_items(len);
            for workers in 1..=12 {
                let partitions = plan_partitions(&items, workers).unwrap();
                assert_eq!(partitions.len(), workers.min(len));

                let sizes: Vec<usize> = partitions.iter().map(Partition::len).collect();
                let max = *sizes.iter().max().unwrap();
                let min = *sizes.iter().min().unwrap();
                assert!(min >= 1, "empty partition for len={len} workers={workers}");
                assert!(max - min <= 1);
                // Non-increasing sizes: extra items land on the earliest partitions
                assert!(sizes.windows(2).all(|w| w[0] >= w[1]));

                let joined: Vec<WorkItem> = partitions
                    .iter()
                    .flat_map(|p| p.items.iter().cloned())
                    .collect();
                assert_eq!(joined, items);

                for (idx, p) in partitions.iter().enumerate() {
                    assert_eq!(p.index, idx);
                }
            }
        }
    }

    #[test]
    fn ten_items_three_workers() {
        let items = make_items(10);
        let partitions = plan_partitions(&items, 3).unwrap();
        let sizes: Vec<usize> = partitions.iter().map(Partition::len).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(partitions[0].items[0].file_name(), "mic_000.mrc");
        assert_eq!(partitions[1].items[0].file_name(), "mic_004.mrc");
        assert_eq!(partitions[2].items[0].file_name(), "mic_007.mrc");
    }

    #[test]
    fn more_workers_than_items_clamps() {
        let items = make_items(2);
        let partitions = plan_partitions(&items, 8).unwrap();
        assert_eq!(partitions.len(), 2);
        assert!(partitions.iter().all(|p| p.len() == 1));
    }

    #[test]
    fn empty_inputs_are_errors() {
        assert_eq!(plan_partitions(&[], 3), Err(PartitionError::NoWorkItems));
        assert_eq!(
            plan_partitions(&make_items(3), 0),
            Err(PartitionError::NoWorkers)
        );
    }
}
