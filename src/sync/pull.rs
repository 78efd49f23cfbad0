//! Pull: snapshot the server repository, download it, merge it locally.

use crate::bundle::BundleRole;
use crate::remote::{Connector, RemoteSession, TransferDirection, with_session};

use super::scripts;
use super::{
    PullOptions, SyncDirection, SyncError, SyncSession, SyncStep, SyncWorkflow, discard_partial,
};

impl<C: Connector> SyncWorkflow<C> {
    /// Bring the server's commits into the local branch.
    ///
    /// A failed download leaves the server bundle in place; running the pull
    /// again creates a fresh one under a new name and overwrites any partial
    /// local copy. A failed merge is left in the working tree as git left it.
    pub fn pull(&self, options: &PullOptions) -> SyncSession {
        let mut record = SyncSession::new(SyncDirection::Pull);
        let result = self.run_pull(&mut record, options);
        self.conclude(record, result)
    }

    fn run_pull(&self, record: &mut SyncSession, options: &PullOptions) -> Result<(), SyncError> {
        self.ensure_repository()?;
        let mut artifact = self.plan.artifact(BundleRole::Server, &self.plan.bundle_dir);
        let repo_path = self.plan.remote_repo_path();
        tracing::info!(project = %self.plan.project, bundle = %artifact.name, "starting pull");

        self.connect_step();
        let outcome = with_session(&self.connector, |remote| {
            self.connected(record);

            self.reporter.step("Creating bundle on server...");
            let output = remote
                .execute(&scripts::create_bundle_script(&repo_path, &artifact.remote_path))
                .map_err(SyncError::remote_bundle_creation)?;
            if let Some(changes) = scripts::marker_count(&output, scripts::UNCOMMITTED_CHANGES) {
                self.warn(
                    record,
                    format!("Server has {changes} uncommitted change(s); only committed work is bundled"),
                );
            }
            if !scripts::has_marker(&output, scripts::BUNDLE_CREATED) {
                return Err(SyncError::RemoteBundleCreation {
                    reason: "the server did not confirm the bundle".into(),
                    output,
                });
            }
            record.reach(SyncStep::RemoteSnapshotted);
            self.reporter.success(&format!("Created {}", artifact.name));

            if let Err(e) = self.transfer(remote, TransferDirection::Download, &mut artifact) {
                discard_partial(&artifact.local_path);
                return Err(SyncError::Transfer(e));
            }
            record.reach(SyncStep::Transferred);

            self.reporter
                .step(&format!("Merging into {}...", self.plan.branch));
            self.repo
                .switch_branch(&self.plan.branch, &artifact.local_path)
                .map_err(|source| SyncError::Checkout {
                    branch: self.plan.branch.clone(),
                    source,
                })?;
            let merged = self
                .repo
                .merge_bundle(&artifact.local_path, &self.plan.branch)
                .map_err(SyncError::MergeConflict)?;
            tracing::debug!(output = %merged, "merge finished");
            record.reach(SyncStep::Merged);
            self.reporter
                .success(&format!("Merged server changes into {}", self.plan.branch));

            self.clean_remote(remote, record, &artifact.remote_path);
            Ok(())
        });
        record.artifact = Some(artifact);
        outcome?;

        if options.forward_upstream {
            self.reporter.step("Pushing to origin...");
            match self.repo.push_to_origin(&self.plan.branch) {
                Ok(_) => {
                    record.reach(SyncStep::UpstreamForwarded);
                    self.reporter.success("Pushed to origin");
                }
                Err(e) => self.warn(
                    record,
                    format!(
                        "Push to origin failed: {e}. Run 'git push origin {}' manually",
                        self.plan.branch
                    ),
                ),
            }
        }

        self.prune_history(record);
        Ok(())
    }
}
