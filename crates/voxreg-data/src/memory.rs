// MemoryFileLoader — in-memory backend
//
// Holds every array in RAM, either as a flat list of `(id, array)` entries
// or as named groups of entries. Useful for building loaders
// programmatically, for synthetic data and for tests. Counts `close()` calls
// so teardown can be observed.

use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::ArrayD;
use tracing::debug;

use voxreg_core::{Error, Result};

use crate::file_loader::{DataIndex, FileLoader, GroupStructure};

/// An in-memory [`FileLoader`].
#[derive(Debug)]
pub struct MemoryFileLoader {
    name: String,
    /// Flat entries, in index order. For grouped data this is the
    /// concatenation of all groups.
    entries: Vec<(String, ArrayD<f32>)>,
    /// Group id and the range of `entries` each group occupies.
    groups: Option<Vec<(String, std::ops::Range<usize>)>>,
    structure: Option<GroupStructure>,
    close_calls: AtomicUsize,
}

impl MemoryFileLoader {
    /// Create a flat backend from `(id, array)` entries.
    pub fn new(name: &str, entries: Vec<(String, ArrayD<f32>)>) -> Self {
        Self {
            name: name.to_string(),
            entries,
            groups: None,
            structure: None,
            close_calls: AtomicUsize::new(0),
        }
    }

    /// Create a flat backend whose ids are the entry positions.
    pub fn from_arrays(name: &str, arrays: Vec<ArrayD<f32>>) -> Self {
        let entries = arrays
            .into_iter()
            .enumerate()
            .map(|(i, a)| (format!("{i}"), a))
            .collect();
        Self::new(name, entries)
    }

    /// Create a grouped backend from `(group_id, entries)` pairs.
    ///
    /// The group structure is not read until
    /// [`set_group_structure`](FileLoader::set_group_structure) is called.
    pub fn grouped(name: &str, groups: Vec<(String, Vec<(String, ArrayD<f32>)>)>) -> Self {
        let mut entries = Vec::new();
        let mut ranges = Vec::with_capacity(groups.len());
        for (group_id, group_entries) in groups {
            let start = entries.len();
            entries.extend(group_entries);
            ranges.push((group_id, start..entries.len()));
        }
        Self {
            name: name.to_string(),
            entries,
            groups: Some(ranges),
            structure: None,
            close_calls: AtomicUsize::new(0),
        }
    }

    /// How many times `close()` has been called.
    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn position(&self, index: DataIndex) -> Result<usize> {
        let out_of_range = || Error::IndexOutOfRange {
            backend: self.name.clone(),
            index: index.to_string(),
        };
        match (index, &self.groups) {
            (DataIndex::Flat(i), _) if i < self.entries.len() => Ok(i),
            (DataIndex::Grouped { group, sample }, Some(groups)) => {
                let (_, range) = groups.get(group).ok_or_else(out_of_range)?;
                let pos = range.start + sample;
                if pos < range.end {
                    Ok(pos)
                } else {
                    Err(out_of_range())
                }
            }
            _ => Err(out_of_range()),
        }
    }
}

impl FileLoader for MemoryFileLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_data(&self, index: DataIndex) -> Result<ArrayD<f32>> {
        let pos = self.position(index)?;
        Ok(self.entries[pos].1.clone())
    }

    fn get_data_ids(&self) -> Result<Vec<String>> {
        Ok(self.entries.iter().map(|(id, _)| id.clone()).collect())
    }

    fn get_num_images(&self) -> usize {
        self.entries.len()
    }

    fn is_grouped(&self) -> bool {
        self.groups.is_some()
    }

    fn set_group_structure(&mut self) -> Result<()> {
        let groups = self.groups.as_ref().ok_or_else(|| Error::Unsupported {
            backend: self.name.clone(),
            operation: "set_group_structure",
        })?;
        let structure = GroupStructure::from_groups(groups.iter().map(|(id, range)| {
            let samples = self.entries[range.clone()]
                .iter()
                .map(|(sample_id, _)| sample_id.clone())
                .collect();
            (id.clone(), samples)
        }))?;
        debug!(
            backend = %self.name,
            num_groups = structure.num_groups(),
            "group structure set"
        );
        self.structure = Some(structure);
        Ok(())
    }

    fn group_structure(&self) -> Option<&GroupStructure> {
        self.structure.as_ref()
    }

    fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn filled(v: f32) -> ArrayD<f32> {
        ArrayD::from_elem(IxDyn(&[2, 2, 2]), v)
    }

    #[test]
    fn flat_backend_reads_by_position() {
        let backend = MemoryFileLoader::from_arrays("images", vec![filled(1.0), filled(2.0)]);
        assert_eq!(backend.get_num_images(), 2);
        assert_eq!(backend.get_data(DataIndex::Flat(1)).unwrap()[[0, 0, 0]], 2.0);
        assert_eq!(backend.get_data_ids().unwrap(), vec!["0", "1"]);
        assert!(backend.get_data(DataIndex::Flat(2)).is_err());
        assert!(!backend.is_grouped());
    }

    #[test]
    fn flat_backend_has_no_groups() {
        let mut backend = MemoryFileLoader::from_arrays("images", vec![filled(1.0)]);
        assert!(matches!(
            backend.set_group_structure(),
            Err(Error::Unsupported { .. })
        ));
        assert!(backend.get_num_groups().is_err());
    }

    #[test]
    fn grouped_backend_reads_by_group_and_sample() {
        let mut backend = MemoryFileLoader::grouped(
            "images",
            vec![
                ("g0".into(), vec![("a".into(), filled(1.0))]),
                (
                    "g1".into(),
                    vec![("b".into(), filled(2.0)), ("c".into(), filled(3.0))],
                ),
            ],
        );
        backend.set_group_structure().unwrap();
        assert_eq!(backend.get_num_groups().unwrap(), 2);
        assert_eq!(backend.get_num_images_per_group().unwrap(), vec![1, 2]);
        let v = backend
            .get_data(DataIndex::Grouped { group: 1, sample: 1 })
            .unwrap();
        assert_eq!(v[[1, 1, 1]], 3.0);
        assert!(backend
            .get_data(DataIndex::Grouped { group: 0, sample: 1 })
            .is_err());
    }

    #[test]
    fn empty_group_fails_when_structure_is_set() {
        let mut backend = MemoryFileLoader::grouped(
            "images",
            vec![
                ("g0".into(), vec![("a".into(), filled(1.0))]),
                ("g1".into(), Vec::new()),
            ],
        );
        match backend.set_group_structure() {
            Err(Error::EmptyGroups { group_ids }) => assert_eq!(group_ids, vec!["g1"]),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn close_is_counted() {
        let backend = MemoryFileLoader::from_arrays("images", vec![filled(0.0)]);
        backend.close().unwrap();
        backend.close().unwrap();
        assert_eq!(backend.close_count(), 2);
    }
}
