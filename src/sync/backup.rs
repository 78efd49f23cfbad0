//! Backup: archive the server repository into the local backup directory.

use crate::bundle::BundleRole;
use crate::remote::{Connector, RemoteSession, TransferDirection, with_session};

use super::scripts;
use super::{SyncDirection, SyncError, SyncSession, SyncStep, SyncWorkflow, discard_partial};

impl<C: Connector> SyncWorkflow<C> {
    /// Download a full bundle of the server repository.
    ///
    /// The server copy is removed whether or not the download succeeded.
    pub fn backup(&self) -> SyncSession {
        let mut record = SyncSession::new(SyncDirection::Backup);
        let result = self.run_backup(&mut record);
        self.conclude(record, result)
    }

    fn run_backup(&self, record: &mut SyncSession) -> Result<(), SyncError> {
        let mut artifact = self.plan.artifact(BundleRole::Backup, &self.plan.backup_dir);
        let repo_path = self.plan.remote_repo_path();
        tracing::info!(project = %self.plan.project, bundle = %artifact.name, "starting backup");

        self.connect_step();
        let outcome = with_session(&self.connector, |remote| {
            self.connected(record);

            self.reporter.step("Creating backup bundle on server...");
            let output = remote
                .execute(&scripts::create_bundle_script(&repo_path, &artifact.remote_path))
                .map_err(SyncError::remote_bundle_creation)?;
            if !scripts::has_marker(&output, scripts::BUNDLE_CREATED) {
                return Err(SyncError::RemoteBundleCreation {
                    reason: "the server did not confirm the bundle".into(),
                    output,
                });
            }
            record.reach(SyncStep::RemoteSnapshotted);
            self.reporter.success(&format!("Created {}", artifact.name));

            let downloaded = self.transfer(remote, TransferDirection::Download, &mut artifact);
            match downloaded {
                Ok(_) => record.reach(SyncStep::Transferred),
                Err(_) => discard_partial(&artifact.local_path),
            }
            self.clean_remote(remote, record, &artifact.remote_path);
            downloaded.map_err(SyncError::Transfer)?;

            self.reporter.success(&format!(
                "Backup saved to {}",
                artifact.local_path.display()
            ));
            Ok(())
        });
        record.artifact = Some(artifact);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::sync::{SyncError, SyncPlan, SyncStep, SyncWorkflow};
    use crate::test_support::{LocalShellConnector, RecordingReporter, commit_file, init_repo};

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, LocalShellConnector, SyncPlan) {
        let server = tempfile::tempdir().unwrap();
        let remote_repo = server.path().join("work/demo");
        init_repo(&remote_repo);
        commit_file(&remote_repo, "a.txt", "1", "one");

        let local = tempfile::tempdir().unwrap();
        let plan = SyncPlan {
            project: "demo".into(),
            branch: "main".into(),
            remote_root: "work".into(),
            repo_root: local.path().to_path_buf(),
            bundle_dir: local.path().join(".gitsync-bundles"),
            backup_dir: local.path().join("backups"),
            max_history: 10,
        };
        let connector = LocalShellConnector::new(server.path());
        (server, local, connector, plan)
    }

    fn remote_bundles(server: &std::path::Path) -> usize {
        fs::read_dir(server.join("work"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|x| x == "bundle"))
            .count()
    }

    #[test]
    fn test_backup_downloads_and_cleans() {
        let (server, _local, connector, plan) = setup();
        let workflow = SyncWorkflow::new(connector, plan.clone(), RecordingReporter::new());

        let session = workflow.backup();

        assert!(session.succeeded(), "{:?}", session.error());
        let artifact = session.artifact.unwrap();
        assert!(artifact.name.starts_with("demo-backup-"));
        assert!(artifact.local_path.starts_with(&plan.backup_dir));
        assert!(artifact.local_path.is_file());
        assert_eq!(remote_bundles(server.path()), 0);
    }

    #[test]
    fn test_backup_cleans_even_when_download_fails() {
        let (server, _local, connector, plan) = setup();
        connector.fail_next_downloads(1);
        let workflow = SyncWorkflow::new(connector.clone(), plan, RecordingReporter::new());

        let session = workflow.backup();

        assert!(matches!(session.error(), Some(SyncError::Transfer(_))));
        assert!(session.has_reached(SyncStep::RemoteCleaned));
        assert!(!session.has_reached(SyncStep::Transferred));
        assert_eq!(remote_bundles(server.path()), 0);
        let artifact = session.artifact.unwrap();
        assert!(!artifact.local_path.exists(), "partial backup must not be kept");
        assert_eq!(connector.closes(), 1);
    }

    #[test]
    fn test_backup_of_missing_project() {
        let (server, _local, connector, plan) = setup();
        fs::remove_dir_all(server.path().join("work/demo")).unwrap();
        let workflow = SyncWorkflow::new(connector, plan, RecordingReporter::new());

        let session = workflow.backup();

        assert!(matches!(
            session.error(),
            Some(SyncError::RemoteBundleCreation { .. })
        ));
    }
}
