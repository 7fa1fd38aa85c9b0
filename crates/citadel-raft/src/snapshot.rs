//! Snapshot capture and install.
//!
//! The state machine's persistent store already contains the full state, so
//! a snapshot is metadata-only: the latest applied index/term and the latest
//! cluster configuration. Installing a snapshot received from a peer swaps
//! the underlying database file atomically: close the current database,
//! rename the installer file into place, reopen, and restore the node-local
//! suffrage record so a non-voter that restores from a snapshot does not
//! silently become a voter.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::RaftError;
use crate::fsm::{open_database, Fsm};
use crate::log::{ConfigurationValue, IndexValue, LocalNodeConfig};

/// Snapshot metadata. The data itself is the database file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub latest: IndexValue,
    pub configuration: ConfigurationValue,
}

impl Fsm {
    /// Capture the metadata describing the current snapshot point.
    #[must_use]
    pub fn snapshot_metadata(&self) -> SnapshotMeta {
        let (latest, configuration) = self.latest_state();
        SnapshotMeta {
            latest,
            configuration,
        }
    }

    /// Install a snapshot database file, replacing the current store.
    ///
    /// `installer` must be a fully written database file on the same
    /// filesystem as the live one (rename must be atomic). The node-local
    /// config present before the install is written back into the new
    /// database. The post-restore callback fires after the swap so upper
    /// layers invalidate their caches.
    ///
    /// # Errors
    ///
    /// - [`RaftError::Snapshot`] if the file swap fails. The store is
    ///   reopened from the original path when possible.
    /// - [`RaftError::Store`] on database failure.
    pub fn install_snapshot(&self, installer: &Path) -> Result<(), RaftError> {
        let preserved = self.local_node_config()?;

        self.with_db_swapped(|slot, live_path| {
            // Close the live database before touching the file.
            drop(slot.take());

            std::fs::rename(installer, live_path).map_err(|e| RaftError::Snapshot {
                reason: format!(
                    "failed to move installer '{}' into place: {e}",
                    installer.display()
                ),
            })?;

            let db = open_database(live_path)?;
            *slot = Some(db);
            Ok(())
        })?;

        if let Some(config) = preserved {
            self.set_local_node_config(&config)?;
        }
        self.reload_metadata()?;
        self.fire_restore_callback();

        let meta = self.snapshot_metadata();
        info!(index = meta.latest.index, term = meta.latest.term, "snapshot installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::dump_data;
    use crate::log::{LogBody, LogData, LogEntry, Operation, Suffrage};

    fn command(index: u64, ops: Vec<Operation>) -> LogEntry {
        LogEntry {
            index,
            term: 1,
            body: LogBody::Command(LogData::new(ops)),
        }
    }

    #[test]
    fn snapshot_metadata_reflects_latest_state() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = Fsm::open(dir.path().join("fsm.redb")).unwrap();
        fsm.apply_batch(&[command(7, vec![Operation::put("a", b"1".to_vec())])])
            .unwrap();
        let meta = fsm.snapshot_metadata();
        assert_eq!(meta.latest.index, 7);
    }

    #[test]
    fn install_replaces_store_contents() {
        let dir = tempfile::tempdir().unwrap();

        // A donor database standing in for a leader-provided snapshot.
        let donor_path = dir.path().join("donor.redb");
        {
            let donor = Fsm::open(&donor_path).unwrap();
            donor
                .apply_batch(&[command(20, vec![Operation::put("from/donor", b"d".to_vec())])])
                .unwrap();
        }

        let fsm = Fsm::open(dir.path().join("fsm.redb")).unwrap();
        fsm.apply_batch(&[command(3, vec![Operation::put("local/old", b"x".to_vec())])])
            .unwrap();

        fsm.install_snapshot(&donor_path).unwrap();

        assert_eq!(fsm.get("from/donor").unwrap(), Some(b"d".to_vec()));
        assert_eq!(fsm.get("local/old").unwrap(), None);
        assert_eq!(fsm.latest_state().0.index, 20);
    }

    #[test]
    fn install_preserves_local_node_config() {
        let dir = tempfile::tempdir().unwrap();

        let donor_path = dir.path().join("donor.redb");
        {
            let donor = Fsm::open(&donor_path).unwrap();
            // Donor was a voter; the restoring node must not inherit that.
            donor
                .set_local_node_config(&LocalNodeConfig {
                    node_id: "donor".to_owned(),
                    suffrage: Suffrage::Voter,
                })
                .unwrap();
        }

        let fsm = Fsm::open(dir.path().join("fsm.redb")).unwrap();
        fsm.set_local_node_config(&LocalNodeConfig {
            node_id: "learner".to_owned(),
            suffrage: Suffrage::NonVoter,
        })
        .unwrap();

        fsm.install_snapshot(&donor_path).unwrap();

        let config = fsm.local_node_config().unwrap().unwrap();
        assert_eq!(config.node_id, "learner");
        assert_eq!(config.suffrage, Suffrage::NonVoter);
    }

    #[test]
    fn restore_callback_fires_after_install() {
        let dir = tempfile::tempdir().unwrap();

        let donor_path = dir.path().join("donor.redb");
        {
            let _ = Fsm::open(&donor_path).unwrap();
        }

        let fsm = Fsm::open(dir.path().join("fsm.redb")).unwrap();
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = std::sync::Arc::clone(&fired);
        fsm.set_restore_callback(Box::new(move || {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }));

        fsm.install_snapshot(&donor_path).unwrap();
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn store_usable_after_install() {
        let dir = tempfile::tempdir().unwrap();
        let donor_path = dir.path().join("donor.redb");
        {
            let donor = Fsm::open(&donor_path).unwrap();
            donor
                .apply_batch(&[command(5, vec![Operation::put("seed", b"s".to_vec())])])
                .unwrap();
        }

        let fsm = Fsm::open(dir.path().join("fsm.redb")).unwrap();
        fsm.install_snapshot(&donor_path).unwrap();

        fsm.apply_batch(&[command(6, vec![Operation::put("post", b"p".to_vec())])])
            .unwrap();
        let data = dump_data(&fsm);
        assert_eq!(data.get("seed"), Some(&b"s".to_vec()));
        assert_eq!(data.get("post"), Some(&b"p".to_vec()));
    }
}
