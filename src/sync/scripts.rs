//! Shell scripts executed on the server.
//!
//! Each script is one round trip. Results come back as marker lines on
//! stdout, so a script that dies halfway is detected by the missing marker
//! even when the transport reports success.

use crate::remote::shell_path;

/// Printed after `git bundle create` succeeds.
pub const BUNDLE_CREATED: &str = "BUNDLE_CREATED";

/// Printed after an uploaded bundle has been merged or cloned.
pub const PUSH_APPLIED: &str = "PUSH_APPLIED";

/// `UNCOMMITTED_CHANGES:<n>` reports a dirty remote working tree.
pub const UNCOMMITTED_CHANGES: &str = "UNCOMMITTED_CHANGES";

/// Bundle every ref of the repository at `repo` into `bundle`.
pub fn create_bundle_script(repo: &str, bundle: &str) -> String {
    let repo = shell_path(repo);
    let bundle = shell_path(bundle);
    format!(
        "cd {repo} || exit 1\n\
         changes=$(git status --porcelain | wc -l | tr -d ' ')\n\
         if [ \"$changes\" != \"0\" ]; then echo \"{UNCOMMITTED_CHANGES}:$changes\"; fi\n\
         git bundle create {bundle} --all || exit 1\n\
         echo {BUNDLE_CREATED}\n"
    )
}

/// Merge `branch` from `bundle` into the repository at `repo`, cloning it
/// from the bundle when the repository does not exist yet.
pub fn apply_bundle_script(root: &str, repo: &str, bundle: &str, branch: &str) -> String {
    let root = shell_path(root);
    let repo = shell_path(repo);
    let bundle = shell_path(bundle);
    let branch = shell_words::quote(branch);
    format!(
        "mkdir -p {root} || exit 1\n\
         if [ -d {repo}/.git ]; then\n\
         \x20 cd {repo} || exit 1\n\
         \x20 if [ \"$(git branch --show-current)\" != {branch} ]; then git checkout {branch} || exit 1; fi\n\
         \x20 git pull --no-rebase --no-edit {bundle} {branch} || exit 1\n\
         else\n\
         \x20 git clone --branch {branch} {bundle} {repo} || exit 1\n\
         fi\n\
         echo {PUSH_APPLIED}\n"
    )
}

pub fn remove_file(path: &str) -> String {
    format!("rm -f {}", shell_path(path))
}

/// Emits `EXISTS:`, `BRANCH:`, `COMMIT:`, `CLEAN:` and `CHANGES:` lines.
pub fn status_script(repo: &str) -> String {
    let repo = shell_path(repo);
    format!(
        "if [ -d {repo}/.git ]; then\n\
         \x20 cd {repo} || exit 1\n\
         \x20 echo \"EXISTS:true\"\n\
         \x20 echo \"BRANCH:$(git branch --show-current)\"\n\
         \x20 echo \"COMMIT:$(git log -1 --oneline 2>/dev/null)\"\n\
         \x20 changes=$(git status --porcelain | wc -l | tr -d ' ')\n\
         \x20 if [ \"$changes\" = \"0\" ]; then echo \"CLEAN:true\"; else echo \"CLEAN:false\"; fi\n\
         \x20 echo \"CHANGES:$changes\"\n\
         else\n\
         \x20 echo \"EXISTS:false\"\n\
         fi\n"
    )
}

/// Prints the full commit id of the remote HEAD.
pub fn head_script(repo: &str) -> String {
    format!("cd {} && git rev-parse HEAD", shell_path(repo))
}

/// Creates `dir` if needed; used to check write access.
pub fn ensure_dir_script(dir: &str) -> String {
    format!("mkdir -p {}", shell_path(dir))
}

/// Whether `marker` appears as a line of its own.
pub fn has_marker(output: &str, marker: &str) -> bool {
    output.lines().any(|line| line.trim() == marker)
}

/// Numeric value of a `MARKER:<n>` line.
pub fn marker_count(output: &str, marker: &str) -> Option<usize> {
    output.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        (key == marker).then(|| value.trim().parse().ok()).flatten()
    })
}
