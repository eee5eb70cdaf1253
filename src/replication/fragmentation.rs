//! Horizontal fragmentation rule

use chrono::NaiveDate;

use crate::config::FragmentationConfig;
use crate::node::NodeId;

/// Maps a record's partition date to the fragment that owns it.
/// Dates before the boundary belong to fragment A, the rest to fragment B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentationRule {
    boundary: NaiveDate,
}

impl FragmentationRule {
    pub fn new(boundary: NaiveDate) -> Self {
        Self { boundary }
    }

    pub fn from_config(config: &FragmentationConfig) -> Self {
        Self::new(config.boundary)
    }

    pub fn boundary(&self) -> NaiveDate {
        self.boundary
    }

    /// Fragment owning a record dated `date`
    pub fn fragment_for(&self, date: NaiveDate) -> NodeId {
        if date < self.boundary {
            NodeId::FragmentA
        } else {
            NodeId::FragmentB
        }
    }

    /// Replication targets for a write executed on `source`
    pub fn targets(&self, source: NodeId, partition: Option<NaiveDate>) -> Vec<NodeId> {
        match (source, partition) {
            (NodeId::Master, Some(date)) => vec![self.fragment_for(date)],
            (NodeId::Master, None) => NodeId::FRAGMENTS.to_vec(),
            (NodeId::FragmentA | NodeId::FragmentB, _) => vec![NodeId::Master],
        }
    }
}

impl Default for FragmentationRule {
    fn default() -> Self {
        Self::from_config(&FragmentationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_boundary_is_inclusive_for_fragment_b() {
        let rule = FragmentationRule::default();
        assert_eq!(rule.boundary(), date(1997, 1, 1));
        assert_eq!(rule.fragment_for(date(1996, 12, 31)), NodeId::FragmentA);
        assert_eq!(rule.fragment_for(date(1997, 1, 1)), NodeId::FragmentB);
        assert_eq!(rule.fragment_for(date(1993, 1, 5)), NodeId::FragmentA);
        assert_eq!(rule.fragment_for(date(1998, 12, 29)), NodeId::FragmentB);
    }

    #[test]
    fn test_targets_by_source() {
        let rule = FragmentationRule::new(date(2000, 1, 1));
        assert_eq!(
            rule.targets(NodeId::Master, Some(date(1999, 6, 1))),
            vec![NodeId::FragmentA]
        );
        assert_eq!(
            rule.targets(NodeId::Master, None),
            vec![NodeId::FragmentA, NodeId::FragmentB]
        );
        assert_eq!(rule.targets(NodeId::FragmentA, None), vec![NodeId::Master]);
        assert_eq!(
            rule.targets(NodeId::FragmentB, Some(date(1990, 1, 1))),
            vec![NodeId::Master]
        );
    }
}
