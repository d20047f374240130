//! Committed version chains

use pessimist_common::{Row, Timestamp, TxnId};

/// A write to a key: a new row image or a tombstone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Put(Row),
    Delete,
}

impl Write {
    pub fn row(&self) -> Option<&Row> {
        match self {
            Write::Put(row) => Some(row),
            Write::Delete => None,
        }
    }

    pub fn into_row(self) -> Option<Row> {
        match self {
            Write::Put(row) => Some(row),
            Write::Delete => None,
        }
    }
}

/// A version that has been committed and will never change again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedVersion {
    pub start_ts: TxnId,
    pub commit_ts: Timestamp,
    pub write: Write,
}

/// Committed versions of one key, oldest first
#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    versions: Vec<CommittedVersion>,
}

impl VersionChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest version with `commit_ts <= ts`
    pub fn visible_at(&self, ts: Timestamp) -> Option<&CommittedVersion> {
        self.versions.iter().rev().find(|v| v.commit_ts <= ts)
    }

    /// Newest committed version
    pub fn latest(&self) -> Option<&CommittedVersion> {
        self.versions.last()
    }

    /// Append a version, keeping the chain sorted by commit timestamp
    pub fn push(&mut self, version: CommittedVersion) {
        let at = self
            .versions
            .partition_point(|v| v.commit_ts <= version.commit_ts);
        self.versions.insert(at, version);
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommittedVersion> {
        self.versions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pessimist_common::Value;

    fn put(start: u64, commit: u64, v: i64) -> CommittedVersion {
        CommittedVersion {
            start_ts: Timestamp::new(start),
            commit_ts: Timestamp::new(commit),
            write: Write::Put(vec![Value::Integer(v)]),
        }
    }

    #[test]
    fn test_visibility_is_inclusive() {
        let mut chain = VersionChain::new();
        chain.push(put(1, 10, 1));
        chain.push(put(11, 20, 2));

        assert!(chain.visible_at(Timestamp::new(9)).is_none());
        assert_eq!(chain.visible_at(Timestamp::new(10)).unwrap().commit_ts, Timestamp::new(10));
        assert_eq!(chain.visible_at(Timestamp::new(19)).unwrap().commit_ts, Timestamp::new(10));
        assert_eq!(chain.visible_at(Timestamp::new(20)).unwrap().commit_ts, Timestamp::new(20));
        assert_eq!(chain.latest().unwrap().commit_ts, Timestamp::new(20));
    }

    #[test]
    fn test_push_keeps_order() {
        let mut chain = VersionChain::new();
        chain.push(put(11, 20, 2));
        chain.push(put(1, 10, 1));

        let order: Vec<_> = chain.iter().map(|v| v.commit_ts.as_u64()).collect();
        assert_eq!(order, vec![10, 20]);
    }

    #[test]
    fn test_tombstone_has_no_row() {
        assert_eq!(Write::Delete.row(), None);
        assert_eq!(
            Write::Put(vec![Value::Integer(1)]).into_row(),
            Some(vec![Value::Integer(1)])
        );
    }
}
