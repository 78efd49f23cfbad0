//! Push: bundle local commits, upload them, apply them on the server.

use crate::bundle::BundleRole;
use crate::remote::{Connector, RemoteSession, TransferDirection, with_session};

use super::scripts;
use super::{SyncDirection, SyncError, SyncSession, SyncStep, SyncWorkflow};

impl<C: Connector> SyncWorkflow<C> {
    /// Send the local repository's committed state to the server.
    ///
    /// The first push clones the project on the server from the bundle;
    /// later pushes merge into the existing checkout. Uncommitted local
    /// changes are reported and left behind.
    pub fn push(&self) -> SyncSession {
        let mut record = SyncSession::new(SyncDirection::Push);
        let result = self.run_push(&mut record);
        self.conclude(record, result)
    }

    fn run_push(&self, record: &mut SyncSession) -> Result<(), SyncError> {
        self.ensure_repository()?;
        match self.repo.dirty_files() {
            Ok(0) => {}
            Ok(n) => self.warn(
                record,
                format!("{n} uncommitted change(s) will not be pushed; commit them first"),
            ),
            Err(e) => tracing::debug!(error = %e, "could not read working tree status"),
        }

        let mut artifact = self.plan.artifact(BundleRole::Local, &self.plan.bundle_dir);
        tracing::info!(project = %self.plan.project, bundle = %artifact.name, "starting push");

        self.reporter.step("Creating local bundle...");
        if let Err(e) = self.repo.create_bundle(&artifact.local_path) {
            record.artifact = Some(artifact);
            return Err(SyncError::LocalBundle(e));
        }
        record.reach(SyncStep::LocalSnapshotted);
        self.reporter.success(&format!("Created {}", artifact.name));

        let repo_path = self.plan.remote_repo_path();
        self.connect_step();
        let outcome = with_session(&self.connector, |remote| {
            self.connected(record);

            self.transfer(remote, TransferDirection::Upload, &mut artifact)
                .map_err(SyncError::Transfer)?;
            record.reach(SyncStep::Transferred);

            self.reporter.step("Applying bundle on server...");
            let script = scripts::apply_bundle_script(
                &self.plan.remote_root,
                &repo_path,
                &artifact.remote_path,
                &self.plan.branch,
            );
            let output = remote.execute(&script).map_err(SyncError::remote_apply)?;
            if !scripts::has_marker(&output, scripts::PUSH_APPLIED) {
                return Err(SyncError::RemoteApply {
                    reason: "the server did not confirm the update".into(),
                    output,
                });
            }
            record.reach(SyncStep::RemoteApplied);
            self.reporter
                .success(&format!("Server updated ({} on {})", self.plan.branch, repo_path));

            self.clean_remote(remote, record, &artifact.remote_path);
            Ok(())
        });
        record.artifact = Some(artifact);
        outcome?;

        self.prune_history(record);
        Ok(())
    }
}
