//! End-to-end repository tests against real git repositories. Commands run
//! through the host-shell executor, so no container runtime is needed.

use std::{path::PathBuf, sync::Arc, time::Duration};

use services::{
    services::{
        environment::EnvironmentError,
        executor::{ContainerExecutor, ExecutorError},
        git::GitCli,
        repository::{Repository, RepositoryError},
    },
    test_support::LocalShellExecutor,
};
use tempfile::TempDir;

struct Harness {
    _source_dir: TempDir,
    _state_dir: TempDir,
    source: PathBuf,
    state: PathBuf,
    executor: Arc<dyn ContainerExecutor>,
}

impl Harness {
    async fn new() -> Self {
        let source_dir = tempfile::tempdir().expect("source dir");
        let state_dir = tempfile::tempdir().expect("state dir");
        let source = source_dir.path().to_path_buf();
        let state = state_dir.path().to_path_buf();

        let git = GitCli::new(&source);
        git.run(&["init", "-b", "main"]).await.expect("git init");
        git.run(&["config", "user.name", "Test User"])
            .await
            .expect("git config");
        git.run(&["config", "user.email", "test@example.com"])
            .await
            .expect("git config");
        std::fs::write(source.join("README.md"), "hello world\n").expect("write README");
        git.run(&["add", "."]).await.expect("git add");
        git.run(&["commit", "-m", "initial commit"])
            .await
            .expect("git commit");

        Self {
            _source_dir: source_dir,
            _state_dir: state_dir,
            source,
            state,
            executor: Arc::new(LocalShellExecutor),
        }
    }

    async fn repo(&self) -> Repository {
        Repository::open_in(&self.source, &self.state)
            .await
            .expect("open repository")
    }

    fn source_git(&self) -> GitCli {
        GitCli::new(&self.source)
    }

    async fn write_and_commit(&self, name: &str, contents: &str, message: &str) {
        std::fs::write(self.source.join(name), contents).expect("write file");
        let git = self.source_git();
        git.run(&["add", "."]).await.expect("git add");
        git.run(&["commit", "-m", message]).await.expect("git commit");
    }

    /// Read a file from the environment branch tip, as the user would with
    /// plain git after a fetch.
    async fn show_from_branch(&self, env_id: &str, path: &str) -> Result<String, String> {
        let git = self.source_git();
        git.run(&["fetch", "container-use"]).await.expect("fetch");
        git.run(&["show", &format!("refs/remotes/container-use/{env_id}:{path}")])
            .await
            .map_err(|e| e.to_string())
    }

    async fn commit_count(&self, env_id: &str) -> usize {
        let git = self.source_git();
        git.run(&["fetch", "container-use"]).await.expect("fetch");
        git.run(&[
            "rev-list",
            "--count",
            &format!("refs/remotes/container-use/{env_id}"),
        ])
        .await
        .expect("rev-list")
        .trim()
        .parse()
        .expect("count")
    }
}

#[tokio::test]
async fn create_starts_from_the_source_tree() {
    let h = Harness::new().await;
    let repo = h.repo().await;

    let env = repo
        .create(&h.executor, "Test Create", "Testing repository create", "")
        .await
        .expect("create environment");

    assert!(!env.id().is_empty());
    assert_eq!(env.info.state.title, "Test Create");

    // The worktree is materialized on disk.
    let worktree = h.state.join("worktrees").join(env.id());
    assert!(worktree.exists());

    // The branch tip tree is the source tree at HEAD plus only the metadata
    // file.
    let git = h.source_git();
    git.run(&["fetch", "container-use"]).await.expect("fetch");
    let changed = git
        .run(&[
            "diff",
            "--name-only",
            &format!("HEAD..refs/remotes/container-use/{}", env.id()),
        ])
        .await
        .expect("diff");
    assert_eq!(changed.trim(), ".container-use/state.json");
}

#[tokio::test]
async fn file_write_round_trips_through_the_branch() {
    let h = Harness::new().await;
    let repo = h.repo().await;
    let mut env = repo
        .create(&h.executor, "Round Trip", "", "")
        .await
        .expect("create");

    env.file_write("test.txt", "hello").await.expect("write");
    repo.update_file(&mut env, "test.txt", "m1")
        .await
        .expect("update_file");

    let from_env = env
        .file_read("test.txt", true, 0, 0)
        .await
        .expect("file_read");
    assert_eq!(from_env, "hello");

    let from_branch = h
        .show_from_branch(env.id(), "test.txt")
        .await
        .expect("file on branch");
    assert_eq!(from_branch, "hello");
}

#[tokio::test]
async fn update_without_changes_creates_no_commit() {
    let h = Harness::new().await;
    let repo = h.repo().await;
    let mut env = repo.create(&h.executor, "No-op", "", "").await.expect("create");

    let before = h.commit_count(env.id()).await;
    repo.update(&mut env, "nothing happened")
        .await
        .expect("update");
    assert_eq!(h.commit_count(env.id()).await, before);
}

#[tokio::test]
async fn log_carries_messages_and_patches() {
    let h = Harness::new().await;
    let repo = h.repo().await;
    let mut env = repo.create(&h.executor, "Test Log", "", "").await.expect("create");

    env.file_write("file1.txt", "initial content").await.expect("write");
    repo.update_file(&mut env, "file1.txt", "Initial commit")
        .await
        .expect("update");
    env.file_write("file1.txt", "updated content").await.expect("write");
    repo.update_file(&mut env, "file1.txt", "Update file")
        .await
        .expect("update");
    env.file_write("file2.txt", "new file").await.expect("write");
    repo.update_file(&mut env, "file2.txt", "Add second file")
        .await
        .expect("update");

    let mut log_buf = Vec::new();
    repo.log(env.id(), false, &mut log_buf).await.expect("log");
    let log_output = String::from_utf8_lossy(&log_buf);
    assert!(log_output.contains("Add second file"));
    assert!(log_output.contains("Update file"));
    assert!(log_output.contains("Initial commit"));
    assert!(!log_output.contains("diff --git"));

    let mut patch_buf = Vec::new();
    repo.log(env.id(), true, &mut patch_buf).await.expect("log -p");
    let patch_output = String::from_utf8_lossy(&patch_buf);
    assert!(patch_output.contains("diff --git"));
    assert!(patch_output.contains("+updated content"));

    let mut sink = Vec::new();
    let err = repo
        .log("non-existent-env", false, &mut sink)
        .await
        .expect_err("log of unknown env");
    assert!(matches!(err, RepositoryError::EnvNotFound(_)));
}

#[tokio::test]
async fn diff_is_relative_to_the_creation_commit() {
    let h = Harness::new().await;
    let repo = h.repo().await;
    let mut env = repo.create(&h.executor, "Test Diff", "", "").await.expect("create");

    env.file_write("test.txt", "initial content\n").await.expect("write");
    repo.update_file(&mut env, "test.txt", "Initial commit")
        .await
        .expect("update");
    env.file_write("test.txt", "initial content\nupdated content\n")
        .await
        .expect("write");
    repo.update_file(&mut env, "test.txt", "Update file")
        .await
        .expect("update");

    let mut buf = Vec::new();
    repo.diff(env.id(), &mut buf).await.expect("diff");
    let output = String::from_utf8_lossy(&buf);
    assert!(output.contains("+updated content"));

    let mut sink = Vec::new();
    let err = repo
        .diff("non-existent-env", &mut sink)
        .await
        .expect_err("diff of unknown env");
    assert!(matches!(err, RepositoryError::EnvNotFound(_)));
}

#[tokio::test]
async fn create_from_git_ref_isolates_history() {
    let h = Harness::new().await;
    h.write_and_commit("initial.txt", "initial content", "add initial")
        .await;
    let git = h.source_git();
    let initial_sha = git
        .run(&["rev-parse", "HEAD"])
        .await
        .expect("rev-parse")
        .trim()
        .to_string();

    git.run(&["checkout", "-b", "feature-branch"]).await.expect("branch");
    h.write_and_commit("feature.txt", "feature content", "Add feature")
        .await;
    git.run(&["checkout", "main"]).await.expect("checkout main");
    h.write_and_commit("main.txt", "main content", "Add main file")
        .await;

    let repo = h.repo().await;

    let env_head = repo
        .create(&h.executor, "From HEAD", "", "")
        .await
        .expect("create from HEAD");
    let content = env_head
        .file_read("main.txt", true, 0, 0)
        .await
        .expect("read main.txt");
    assert!(content.contains("main content"));

    let env_feature = repo
        .create(&h.executor, "From Feature", "", "feature-branch")
        .await
        .expect("create from feature branch");
    let feature_content = env_feature
        .file_read("feature.txt", true, 0, 0)
        .await
        .expect("read feature.txt");
    assert!(feature_content.contains("feature content"));
    assert!(
        env_feature.file_read("main.txt", true, 0, 0).await.is_err(),
        "main.txt should not exist in feature branch environment"
    );

    let env_sha = repo
        .create(&h.executor, "From SHA", "", &initial_sha)
        .await
        .expect("create from SHA");
    assert!(env_sha.file_read("initial.txt", true, 0, 0).await.is_ok());
    assert!(env_sha.file_read("main.txt", true, 0, 0).await.is_err());
    assert!(env_sha.file_read("feature.txt", true, 0, 0).await.is_err());

    let err = repo
        .create(&h.executor, "Invalid Ref", "", "nonexistent-ref")
        .await
        .expect_err("invalid ref should fail");
    assert!(matches!(err, RepositoryError::RefNotFound(_)));
}

#[tokio::test]
async fn submodule_content_is_readable_but_never_written() {
    let h = Harness::new().await;

    // A second repository to use as a submodule.
    let sub_dir = tempfile::tempdir().expect("submodule dir");
    let sub_git = GitCli::new(sub_dir.path());
    sub_git.run(&["init", "-b", "main"]).await.expect("init");
    sub_git.run(&["config", "user.name", "Test User"]).await.expect("config");
    sub_git
        .run(&["config", "user.email", "test@example.com"])
        .await
        .expect("config");
    std::fs::write(
        sub_dir.path().join("README.md"),
        "Test fixtures used by integration tests.\n",
    )
    .expect("write");
    sub_git.run(&["add", "."]).await.expect("add");
    sub_git.run(&["commit", "-m", "init"]).await.expect("commit");

    let git = h.source_git();
    let sub_path = sub_dir.path().to_string_lossy().to_string();
    git.run(&[
        "-c",
        "protocol.file.allow=always",
        "submodule",
        "add",
        &sub_path,
        "submodule",
    ])
    .await
    .expect("submodule add");
    git.run(&["commit", "-am", "add submodule"]).await.expect("commit");

    let repo = h.repo().await;
    let mut env = repo
        .create(&h.executor, "Test Submodule", "", "")
        .await
        .expect("create");

    env.file_write("test.txt", "initial content\n").await.expect("write");
    repo.update_file(&mut env, "test.txt", "Initial commit")
        .await
        .expect("update");

    // Direct writes into the submodule are rejected.
    let err = env
        .file_write("submodule/test.txt", "This should fail")
        .await
        .expect_err("submodule write must fail");
    assert!(matches!(err, EnvironmentError::SubmoduleWriteForbidden(_)));

    repo.update(&mut env, "write the env back to the repo")
        .await
        .expect("update");

    // Submodule contents are cloned into the environment for reading.
    let readme = env
        .file_read("submodule/README.md", true, 0, 0)
        .await
        .expect("read submodule README");
    assert!(readme.contains("Test fixtures"));

    // Command-driven writes into the submodule succeed inside the container
    // but are discarded on reconciliation.
    env.run(
        "echo 'content from env_run_cmd' > submodule/test-from-cmd.txt",
        "sh",
        false,
    )
    .await
    .expect("run");
    let written = env
        .file_read("submodule/test-from-cmd.txt", true, 0, 0)
        .await
        .expect("read file written by run");
    assert!(written.contains("content from env_run_cmd"));

    repo.update(&mut env, "update the env back to the repo")
        .await
        .expect("update");

    assert!(
        !h.source.join("submodule/test-from-cmd.txt").exists(),
        "submodule write must not reach the host"
    );
    assert!(
        h.show_from_branch(env.id(), "submodule/test-from-cmd.txt")
            .await
            .is_err(),
        "submodule write must not reach the branch"
    );
    let status = h.source_git().status_porcelain().await.expect("status");
    assert!(
        status.trim().is_empty(),
        "source working tree must stay clean, got: {status}"
    );
}

#[tokio::test]
async fn delete_removes_branch_worktree_and_index_entry() {
    let h = Harness::new().await;
    let repo = h.repo().await;
    let env = repo.create(&h.executor, "Test Delete", "", "").await.expect("create");
    let env_id = env.id().to_string();
    let worktree = h.state.join("worktrees").join(&env_id);
    assert!(worktree.exists());

    repo.delete(&h.executor, &env_id).await.expect("delete");

    let err = repo.get(&h.executor, &env_id).await.expect_err("get after delete");
    assert!(matches!(err, RepositoryError::EnvNotFound(_)));
    assert!(!worktree.exists());

    // Idempotent.
    repo.delete(&h.executor, &env_id).await.expect("second delete");
}

#[tokio::test]
async fn list_includes_every_created_environment() {
    let h = Harness::new().await;
    let repo = h.repo().await;
    let env1 = repo.create(&h.executor, "Environment 1", "", "").await.expect("create");
    let env2 = repo.create(&h.executor, "Environment 2", "", "").await.expect("create");

    let envs = repo.list().await.expect("list");
    assert!(envs.len() >= 2);
    let ids: Vec<&str> = envs.iter().map(|e| e.id.as_str()).collect();
    assert!(ids.contains(&env1.id()));
    assert!(ids.contains(&env2.id()));
}

#[tokio::test]
async fn get_reloads_state_from_the_branch() {
    let h = Harness::new().await;
    let repo = h.repo().await;
    let mut env = repo.create(&h.executor, "Test Get", "", "").await.expect("create");
    env.file_write("kept.txt", "kept").await.expect("write");
    repo.update_file(&mut env, "kept.txt", "keep a file")
        .await
        .expect("update");

    let reloaded = repo.get(&h.executor, env.id()).await.expect("get");
    assert_eq!(reloaded.id(), env.id());
    assert_eq!(reloaded.info.state.title, "Test Get");
    assert_eq!(
        reloaded.file_read("kept.txt", true, 0, 0).await.expect("read"),
        "kept"
    );

    let err = repo
        .get(&h.executor, "non-existent-env")
        .await
        .expect_err("unknown env");
    assert!(matches!(err, RepositoryError::EnvNotFound(_)));
}

#[tokio::test]
async fn checkout_lands_the_source_on_the_environment_branch() {
    let h = Harness::new().await;
    let repo = h.repo().await;
    let mut env = repo.create(&h.executor, "Test Checkout", "", "").await.expect("create");
    env.file_write("test.txt", "test content").await.expect("write");
    repo.update_file(&mut env, "test.txt", "Add test file")
        .await
        .expect("update");

    let branch = repo.checkout(env.id(), "").await.expect("checkout");
    assert_eq!(branch, format!("cu-{}", env.id()));

    let git = h.source_git();
    let current = git
        .run(&["branch", "--show-current"])
        .await
        .expect("show-current");
    assert_eq!(current.trim(), branch);
    assert_eq!(
        std::fs::read_to_string(h.source.join("test.txt")).expect("read"),
        "test content"
    );
    let status = git.status_porcelain().await.expect("status");
    assert!(status.trim().is_empty());
}

#[tokio::test]
async fn checkout_refuses_a_dirty_source_tree() {
    let h = Harness::new().await;
    let repo = h.repo().await;
    let env = repo.create(&h.executor, "Dirty", "", "").await.expect("create");

    std::fs::write(h.source.join("uncommitted.txt"), "wip").expect("write");
    let err = repo
        .checkout(env.id(), "")
        .await
        .expect_err("checkout with dirty tree");
    assert!(matches!(err, RepositoryError::DirtyWorkingTree(_)));
}

#[tokio::test]
async fn is_dirty_reports_uncommitted_changes() {
    let h = Harness::new().await;
    let repo = h.repo().await;

    let (dirty, _) = repo.is_dirty().await.expect("is_dirty");
    assert!(!dirty);

    std::fs::write(h.source.join("scratchpad.txt"), "wip").expect("write");
    let (dirty, status) = repo.is_dirty().await.expect("is_dirty");
    assert!(dirty);
    assert!(status.contains("scratchpad.txt"));
}

#[tokio::test]
async fn ambiguous_edits_require_a_match_index() {
    let h = Harness::new().await;
    let repo = h.repo().await;
    let mut env = repo.create(&h.executor, "Test Edit", "", "").await.expect("create");

    env.file_write("notes.txt", "a\nfoo\nb\nfoo\nc").await.expect("write");
    repo.update_file(&mut env, "notes.txt", "seed").await.expect("update");

    let err = env
        .file_edit("notes.txt", "foo", "F", "")
        .await
        .expect_err("two matches without which_match");
    assert!(matches!(err, EnvironmentError::AmbiguousMatch { count: 2, .. }));

    env.file_edit("notes.txt", "foo", "F", "2").await.expect("edit");
    repo.update_file(&mut env, "notes.txt", "replace second foo")
        .await
        .expect("update");
    assert_eq!(
        env.file_read("notes.txt", true, 0, 0).await.expect("read"),
        "a\nfoo\nb\nF\nc"
    );
}

#[tokio::test]
async fn cancelled_runs_still_reconcile_partial_state() {
    let h = Harness::new().await;
    let repo = h.repo().await;
    let mut env = repo.create(&h.executor, "Test Cancel", "", "").await.expect("create");

    let token = env.cancel_token();
    let run = env.run("echo partial > partial.txt && sleep 30", "sh", false);
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        token.cancel();
    };
    let (result, ()) = tokio::join!(run, cancel);
    match result {
        Err(EnvironmentError::Executor(ExecutorError::Cancelled)) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }

    repo.update(&mut env, "after cancellation").await.expect("update");
    let partial = h
        .show_from_branch(env.id(), "partial.txt")
        .await
        .expect("partial state must be committed");
    assert_eq!(partial.trim(), "partial");
}

#[tokio::test]
async fn failed_commands_keep_their_output_and_state() {
    let h = Harness::new().await;
    let repo = h.repo().await;
    let mut env = repo.create(&h.executor, "Test Failure", "", "").await.expect("create");

    let err = env
        .run("echo before-failure > out.txt && exit 3", "sh", false)
        .await
        .expect_err("non-zero exit");
    match err {
        EnvironmentError::Executor(ExecutorError::CommandFailed { exit_code, .. }) => {
            assert_eq!(exit_code, 3)
        }
        other => panic!("expected CommandFailed, got {other:?}"),
    }

    repo.update(&mut env, "after failed command").await.expect("update");
    let committed = h
        .show_from_branch(env.id(), "out.txt")
        .await
        .expect("state before failure must be committed");
    assert_eq!(committed.trim(), "before-failure");
}

#[tokio::test]
async fn file_reads_support_line_ranges_and_listings() {
    let h = Harness::new().await;
    let repo = h.repo().await;
    let mut env = repo.create(&h.executor, "Test Read", "", "").await.expect("create");

    env.file_write("lines.txt", "one\ntwo\nthree\nfour\n").await.expect("write");
    repo.update_file(&mut env, "lines.txt", "seed").await.expect("update");

    let range = env.file_read("lines.txt", false, 2, 3).await.expect("range read");
    assert_eq!(range, "two\nthree\n");

    env.file_write("dir/nested.txt", "x").await.expect("write nested");
    let listing = env.file_list(".").await.expect("list");
    assert!(listing.contains("dir/"));
    assert!(listing.contains("lines.txt"));
    assert!(!listing.contains(".container-use"));

    env.file_delete("lines.txt").await.expect("delete");
    repo.update(&mut env, "drop lines.txt").await.expect("update");
    assert!(
        h.show_from_branch(env.id(), "lines.txt").await.is_err(),
        "deleted file must be gone from the branch"
    );
}
