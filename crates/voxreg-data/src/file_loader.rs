// FileLoader — the capability every storage backend exposes
//
// A backend owns one role of the data (moving images, fixed labels, ...) and
// hands out dense arrays by index. Flat backends are addressed with
// `DataIndex::Flat(i)`; grouped backends (one bucket per subject, say) are
// addressed with `DataIndex::Grouped { group, sample }` once their group
// structure has been set.

use std::collections::HashMap;
use std::fmt;

use ndarray::ArrayD;

use voxreg_core::{Error, Result};

/// Address of one unit of data inside a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataIndex {
    /// Position in a flat backend.
    Flat(usize),
    /// Position of a sample inside a group, both counted in backend order.
    Grouped { group: usize, sample: usize },
}

impl fmt::Display for DataIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataIndex::Flat(i) => write!(f, "{i}"),
            DataIndex::Grouped { group, sample } => write!(f, "({group}, {sample})"),
        }
    }
}

/// Group layout of a grouped backend.
///
/// Built once, when the backend's group structure is set. Every group must
/// hold at least one sample; empty groups are rejected here so that sampling
/// never starts on a malformed layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStructure {
    group_ids: Vec<String>,
    group_sample_dict: HashMap<String, Vec<String>>,
}

impl GroupStructure {
    /// Create a group structure from ordered group ids and their samples.
    ///
    /// Fails with [`Error::EmptyGroups`] listing every group without samples,
    /// and with [`Error::Backend`] when a listed group has no entry at all.
    pub fn new(
        group_ids: Vec<String>,
        group_sample_dict: HashMap<String, Vec<String>>,
    ) -> Result<Self> {
        if let Some(missing) = group_ids.iter().find(|g| !group_sample_dict.contains_key(*g)) {
            return Err(Error::Backend {
                backend: "group structure".to_string(),
                message: format!("group {missing} is listed but has no sample entry"),
            });
        }
        let empty: Vec<String> = group_ids
            .iter()
            .filter(|g| group_sample_dict[*g].is_empty())
            .cloned()
            .collect();
        if !empty.is_empty() {
            return Err(Error::EmptyGroups { group_ids: empty });
        }
        Ok(Self {
            group_ids,
            group_sample_dict,
        })
    }

    /// Build from `(group_id, sample_ids)` pairs, preserving their order.
    pub fn from_groups<I, S>(groups: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<String>)>,
        S: Into<String>,
    {
        let mut group_ids = Vec::new();
        let mut group_sample_dict = HashMap::new();
        for (id, samples) in groups {
            let id = id.into();
            group_ids.push(id.clone());
            group_sample_dict.insert(id, samples);
        }
        Self::new(group_ids, group_sample_dict)
    }

    pub fn group_ids(&self) -> &[String] {
        &self.group_ids
    }

    /// Sample ids of a group, in order.
    pub fn samples(&self, group_id: &str) -> Option<&[String]> {
        self.group_sample_dict.get(group_id).map(Vec::as_slice)
    }

    pub fn num_groups(&self) -> usize {
        self.group_ids.len()
    }

    /// Number of samples of every group, in group order.
    pub fn num_images_per_group(&self) -> Vec<usize> {
        self.group_ids
            .iter()
            .map(|g| self.group_sample_dict.get(g).map_or(0, Vec::len))
            .collect()
    }

    /// Total number of samples over all groups.
    pub fn num_images(&self) -> usize {
        self.num_images_per_group().iter().sum()
    }
}

/// A storage backend for one role of the data.
///
/// Implementations must be `Send + Sync`: loaders share backends between
/// the moving and fixed roles and read them from rayon workers.
pub trait FileLoader: Send + Sync {
    /// Name used in logs and error messages (e.g. `"moving_images"`).
    fn name(&self) -> &str;

    /// Return the array stored at `index`.
    fn get_data(&self, index: DataIndex) -> Result<ArrayD<f32>>;

    /// Unique ids of the stored entries, in index order.
    ///
    /// Used to check that images and labels, moving and fixed, line up.
    fn get_data_ids(&self) -> Result<Vec<String>>;

    /// Number of stored entries.
    fn get_num_images(&self) -> usize;

    /// Whether this backend stores grouped data.
    fn is_grouped(&self) -> bool {
        false
    }

    /// Read the group layout from storage and keep it for later queries.
    fn set_group_structure(&mut self) -> Result<()> {
        Err(Error::Unsupported {
            backend: self.name().to_string(),
            operation: "set_group_structure",
        })
    }

    /// The group layout, once [`set_group_structure`](Self::set_group_structure)
    /// has succeeded.
    fn group_structure(&self) -> Option<&GroupStructure> {
        None
    }

    /// Number of groups.
    fn get_num_groups(&self) -> Result<usize> {
        self.group_structure()
            .map(GroupStructure::num_groups)
            .ok_or_else(|| Error::Unsupported {
                backend: self.name().to_string(),
                operation: "get_num_groups",
            })
    }

    /// Number of images of each group; fails if any group is empty.
    fn get_num_images_per_group(&self) -> Result<Vec<usize>> {
        let structure = self.group_structure().ok_or_else(|| Error::Unsupported {
            backend: self.name().to_string(),
            operation: "get_num_images_per_group",
        })?;
        let counts = structure.num_images_per_group();
        let empty: Vec<String> = structure
            .group_ids()
            .iter()
            .zip(&counts)
            .filter(|(_, n)| **n == 0)
            .map(|(g, _)| g.clone())
            .collect();
        if !empty.is_empty() {
            return Err(Error::EmptyGroups { group_ids: empty });
        }
        Ok(counts)
    }

    /// Release opened handles. Must tolerate repeated calls.
    fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn structure_counts_samples_in_group_order() {
        let gs = GroupStructure::from_groups(vec![
            ("b", ids(&["b0", "b1", "b2"])),
            ("a", ids(&["a0"])),
        ])
        .unwrap();
        assert_eq!(gs.group_ids(), &["b".to_string(), "a".to_string()]);
        assert_eq!(gs.num_images_per_group(), vec![3, 1]);
        assert_eq!(gs.num_images(), 4);
        assert_eq!(gs.samples("a"), Some(&["a0".to_string()][..]));
    }

    #[test]
    fn structure_rejects_empty_groups() {
        let err = GroupStructure::from_groups(vec![
            ("a", ids(&["a0"])),
            ("b", Vec::new()),
            ("c", Vec::new()),
        ])
        .unwrap_err();
        match err {
            Error::EmptyGroups { group_ids } => assert_eq!(group_ids, ids(&["b", "c"])),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn structure_rejects_unlisted_groups() {
        let err = GroupStructure::new(ids(&["a"]), HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));
    }

    #[test]
    fn data_index_display() {
        assert_eq!(DataIndex::Flat(3).to_string(), "3");
        assert_eq!(
            DataIndex::Grouped { group: 1, sample: 2 }.to_string(),
            "(1, 2)"
        );
    }
}
