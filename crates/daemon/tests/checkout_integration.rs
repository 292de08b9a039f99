use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use gitsync_common::types::{CheckoutConfig, CommitAction, RepoStatus};
use gitsync_daemon::git::{Checkout, Context, Repo, RepoOptions};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    comment: String,
}

const MANIFESTS: &[(&str, &str)] = &[
    (
        "helloworld-deploy.yaml",
        "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: helloworld\n",
    ),
    (
        "locked-service-deploy.yaml",
        "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: locked-service\n",
    ),
    (
        "test-service-deploy.yaml",
        "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: test-service\n",
    ),
];

fn test_config() -> CheckoutConfig {
    CheckoutConfig::new("master", "example", "example@example.com", "flux-test", "fluxtest")
}

fn ctx() -> Context {
    Context::background().with_timeout(Duration::from_secs(30))
}

/// A bare remote seeded with one commit of manifests, plus a handle whose
/// mirror has been cloned.
struct Fixture {
    temp: TempDir,
    remote: PathBuf,
    repo: Repo,
}

impl Fixture {
    async fn new() -> Self {
        Self::with_options(|_| {}).await
    }

    async fn with_options(adjust: impl FnOnce(&mut RepoOptions)) -> Self {
        let temp = TempDir::new().expect("tempdir should be created");
        let remote = temp.path().join("remote.git");
        let seed = temp.path().join("seed");

        run_git(temp.path(), &["init", "--bare", "--initial-branch=master", path_str(&remote)]);
        run_git(temp.path(), &["init", "--initial-branch=master", path_str(&seed)]);
        run_git(&seed, &["config", "user.name", "Seeder"]);
        run_git(&seed, &["config", "user.email", "seeder@example.com"]);
        for (name, contents) in MANIFESTS {
            std::fs::write(seed.join(name), contents).expect("seed manifest should be written");
        }
        run_git(&seed, &["add", "."]);
        run_git(&seed, &["commit", "--no-verify", "-m", "Initial manifests"]);
        run_git(&seed, &["push", path_str(&remote), "master"]);

        let mut options = RepoOptions::new(temp.path().join("cache"));
        adjust(&mut options);
        let repo = Repo::new(path_str(&remote), options);
        repo.ensure_cloned(&ctx()).await.expect("mirror should clone");

        Self { temp, remote, repo }
    }

    async fn checkout(&self, config: CheckoutConfig) -> Checkout {
        self.repo.checkout(&ctx(), config).await.expect("checkout should clone")
    }

    fn remote_rev(&self, reference: &str) -> String {
        let args = ["--git-dir", path_str(&self.remote), "rev-parse", reference];
        run_git_capture(self.temp.path(), &args).trim().to_string()
    }
}

fn write_manifest(checkout: &Checkout, name: &str, contents: &str) {
    let dirs = checkout.manifest_dirs();
    std::fs::write(dirs[0].join(name), contents).expect("manifest should be written");
}

#[tokio::test]
async fn checkout_notes_and_convergence() {
    let fixture = Fixture::new().await;
    fixture.repo.ready(&ctx()).await.expect("repo should be ready");
    assert_eq!(fixture.repo.status(), RepoStatus::Ready);

    let checkout = fixture.checkout(test_config()).await;

    // A fresh clone has no notes; that is not an error.
    let head = checkout.head_revision(&ctx()).await.unwrap();
    let note: Option<Note> =
        checkout.get_note(&ctx(), &head).await.expect("missing note is not an error");
    assert_eq!(note, None);

    let changed = MANIFESTS[0].0;
    write_manifest(&checkout, changed, "FIRST CHANGE");
    let first = checkout
        .commit_and_push::<Note>(&ctx(), &CommitAction::new("Changed file"), None)
        .await
        .expect("first push should succeed");
    assert_ne!(first, head);
    assert_eq!(checkout.head_revision(&ctx()).await.unwrap(), first);

    write_manifest(&checkout, changed, "SECOND CHANGE");
    let expected = Note { comment: "Expected comment".into() };
    let second = checkout
        .commit_and_push(&ctx(), &CommitAction::new("Changed file again"), Some(&expected))
        .await
        .expect("second push should succeed");

    assert_eq!(fixture.remote_rev("refs/heads/master"), second);
    assert_eq!(fixture.remote_rev("refs/tags/flux-test^{commit}"), second);
    assert_eq!(checkout.sync_revision(&ctx()).await.unwrap().as_deref(), Some(second.as_str()));
    assert_eq!(checkout.changed_files(&ctx(), &head).await.unwrap(), vec![changed.to_string()]);
    assert!(checkout.note_revisions(&ctx()).await.unwrap().contains(&second));

    fixture.repo.refresh(&ctx()).await.expect("refresh should succeed");
    let another = fixture.checkout(test_config()).await;
    assert_ne!(another.dir(), checkout.dir());

    let contents = std::fs::read_to_string(another.manifest_dirs()[0].join(changed)).unwrap();
    assert_eq!(contents, "SECOND CHANGE");
    let rev = another.head_revision(&ctx()).await.unwrap();
    assert_eq!(rev, second);
    let note: Option<Note> = another.get_note(&ctx(), &rev).await.unwrap();
    assert_eq!(note, Some(expected));

    let commits = fixture.repo.commits_before(&ctx(), "HEAD").await.unwrap();
    let messages: Vec<&str> = commits.iter().map(|commit| commit.message.as_str()).collect();
    assert_eq!(messages, vec!["Changed file again", "Changed file", "Initial manifests"]);
    assert_eq!(commits[0].author_name, "example");

    let between = fixture
        .repo
        .commits_between(&ctx(), &head, "HEAD", &[changed.to_string()])
        .await
        .unwrap();
    assert_eq!(between.len(), 2);

    checkout.clean();
    another.clean();
    assert!(!checkout.dir().exists());
    assert!(!another.dir().exists());
}

#[tokio::test]
async fn commit_message_carries_skip_marker_once() {
    let fixture = Fixture::new().await;
    let config = test_config().with_skip_message(" **SKIP**");
    let checkout = fixture.checkout(config).await;

    write_manifest(&checkout, MANIFESTS[0].0, "FIRST CHANGE");
    checkout
        .commit_and_push::<Note>(&ctx(), &CommitAction::new("Changed file"), None)
        .await
        .expect("push should succeed");

    fixture.repo.refresh(&ctx()).await.unwrap();
    let commits = fixture.repo.commits_before(&ctx(), "HEAD").await.unwrap();
    assert!(!commits.is_empty());
    assert_eq!(commits[0].message, "Changed file **SKIP**");
    checkout.clean();
}

#[tokio::test]
async fn author_override_is_recorded() {
    let fixture = Fixture::new().await;
    let checkout = fixture.checkout(test_config()).await;

    write_manifest(&checkout, MANIFESTS[1].0, "AUTHORED CHANGE");
    let action =
        CommitAction::new("Changed by someone else").with_author("Jane Doe <jane@example.com>");
    checkout.commit_and_push::<Note>(&ctx(), &action, None).await.unwrap();

    fixture.repo.refresh(&ctx()).await.unwrap();
    let commits = fixture.repo.commits_before(&ctx(), "HEAD").await.unwrap();
    assert_eq!(commits[0].author_name, "Jane Doe");
    assert_eq!(commits[0].author_email, "jane@example.com");
    checkout.clean();
}

#[tokio::test]
async fn nothing_to_commit_is_a_commit_error() {
    let fixture = Fixture::new().await;
    let checkout = fixture.checkout(test_config()).await;

    let error = checkout
        .commit_and_push::<Note>(&ctx(), &CommitAction::new("No changes"), None)
        .await
        .expect_err("empty commit should fail");

    assert!(error.is_nothing_to_commit(), "unexpected error: {error}");
    assert!(!error.is_cancelled());
    checkout.clean();
}

#[tokio::test]
async fn concurrent_push_is_rebased_and_note_lands_on_final_commit() {
    let fixture = Fixture::new().await;
    let winner = fixture.checkout(test_config()).await;
    let loser = fixture.checkout(test_config()).await;

    write_manifest(&winner, MANIFESTS[0].0, "WINNER CHANGE");
    let winner_rev = winner
        .commit_and_push::<Note>(&ctx(), &CommitAction::new("Winner"), None)
        .await
        .expect("winner push should succeed");

    // The loser's view predates the winner's push.
    write_manifest(&loser, MANIFESTS[2].0, "LOSER CHANGE");
    let note = Note { comment: "loser note".into() };
    let landed = loser
        .commit_and_push(&ctx(), &CommitAction::new("Loser"), Some(&note))
        .await
        .expect("loser push should succeed after rebase");

    assert_ne!(landed, winner_rev);
    assert_eq!(fixture.remote_rev("refs/heads/master"), landed);
    assert_eq!(fixture.remote_rev("refs/heads/master^"), winner_rev);
    assert_eq!(fixture.remote_rev("refs/tags/flux-test^{commit}"), landed);

    fixture.repo.refresh(&ctx()).await.unwrap();
    let observer = fixture.checkout(test_config()).await;
    assert_eq!(observer.head_revision(&ctx()).await.unwrap(), landed);
    let seen: Option<Note> = observer.get_note(&ctx(), &landed).await.unwrap();
    assert_eq!(seen, Some(note));
    let dir = &observer.manifest_dirs()[0];
    assert_eq!(std::fs::read_to_string(dir.join(MANIFESTS[0].0)).unwrap(), "WINNER CHANGE");
    assert_eq!(std::fs::read_to_string(dir.join(MANIFESTS[2].0)).unwrap(), "LOSER CHANGE");

    winner.clean();
    loser.clean();
    observer.clean();
}

#[tokio::test]
async fn single_attempt_surfaces_push_error() {
    let fixture = Fixture::new().await;
    let winner = fixture.checkout(test_config()).await;

    write_manifest(&winner, MANIFESTS[0].0, "WINNER CHANGE");
    let first = winner
        .commit_and_push::<Note>(&ctx(), &CommitAction::new("Winner"), None)
        .await
        .unwrap();
    fixture.repo.refresh(&ctx()).await.unwrap();

    let loser = fixture.checkout(test_config().with_push_attempts(1)).await;
    assert_eq!(loser.sync_revision(&ctx()).await.unwrap().as_deref(), Some(first.as_str()));

    write_manifest(&winner, MANIFESTS[1].0, "WINNER AGAIN");
    let second = winner
        .commit_and_push::<Note>(&ctx(), &CommitAction::new("Winner again"), None)
        .await
        .unwrap();

    write_manifest(&loser, MANIFESTS[2].0, "LOSER CHANGE");
    let before = loser.head_revision(&ctx()).await.unwrap();
    let error = loser
        .commit_and_push::<Note>(&ctx(), &CommitAction::new("Loser"), None)
        .await
        .expect_err("push should be rejected");

    assert!(
        matches!(error, gitsync_daemon::git::GitError::Push { attempts: 1, .. }),
        "unexpected error: {error}"
    );
    // The change is kept as a local commit, not dropped.
    assert_ne!(loser.head_revision(&ctx()).await.unwrap(), before);
    // The sync tag still names the last commit that reached the remote.
    assert_eq!(loser.sync_revision(&ctx()).await.unwrap().as_deref(), Some(first.as_str()));
    assert_eq!(fixture.remote_rev("refs/tags/flux-test^{commit}"), second);

    winner.clean();
    loser.clean();
}

#[tokio::test]
async fn note_set_locally_lands_with_next_push() {
    let fixture = Fixture::new().await;
    let checkout = fixture.checkout(test_config()).await;

    write_manifest(&checkout, MANIFESTS[0].0, "FIRST CHANGE");
    let first = checkout
        .commit_and_push::<Note>(&ctx(), &CommitAction::new("Changed file"), None)
        .await
        .unwrap();
    let note = Note { comment: "attached afterwards".into() };
    checkout.set_note(&ctx(), &first, &note).await.unwrap();

    write_manifest(&checkout, MANIFESTS[0].0, "SECOND CHANGE");
    checkout
        .commit_and_push::<Note>(&ctx(), &CommitAction::new("Changed file again"), None)
        .await
        .unwrap();

    fixture.repo.refresh(&ctx()).await.unwrap();
    let fresh = fixture.checkout(test_config()).await;
    let seen: Option<Note> = fresh.get_note(&ctx(), &first).await.unwrap();
    assert_eq!(seen, Some(note));

    checkout.clean();
    fresh.clean();
}

#[tokio::test]
async fn retried_push_keeps_notes_from_both_sides() {
    let fixture = Fixture::new().await;
    let winner = fixture.checkout(test_config()).await;
    let loser = fixture.checkout(test_config()).await;

    let base = loser.head_revision(&ctx()).await.unwrap();
    let local = Note { comment: "local".into() };
    loser.set_note(&ctx(), &base, &local).await.unwrap();

    write_manifest(&winner, MANIFESTS[0].0, "WINNER CHANGE");
    let winner_note = Note { comment: "winner".into() };
    let winner_rev = winner
        .commit_and_push(&ctx(), &CommitAction::new("Winner"), Some(&winner_note))
        .await
        .unwrap();

    write_manifest(&loser, MANIFESTS[2].0, "LOSER CHANGE");
    let loser_note = Note { comment: "loser".into() };
    let landed = loser
        .commit_and_push(&ctx(), &CommitAction::new("Loser"), Some(&loser_note))
        .await
        .expect("loser push should succeed after rebase");

    fixture.repo.refresh(&ctx()).await.unwrap();
    let observer = fixture.checkout(test_config()).await;
    let on_base: Option<Note> = observer.get_note(&ctx(), &base).await.unwrap();
    let on_winner: Option<Note> = observer.get_note(&ctx(), &winner_rev).await.unwrap();
    let on_landed: Option<Note> = observer.get_note(&ctx(), &landed).await.unwrap();
    assert_eq!(on_base, Some(local));
    assert_eq!(on_winner, Some(winner_note));
    assert_eq!(on_landed, Some(loser_note));

    winner.clean();
    loser.clean();
    observer.clean();
}

#[tokio::test]
async fn cancelled_context_leaves_no_checkout_behind() {
    let fixture = Fixture::new().await;
    let cancelled = Context::background();
    cancelled.cancel();

    let error =
        fixture.repo.checkout(&cancelled, test_config()).await.err().expect("checkout should fail");
    assert!(error.is_cancelled(), "unexpected error: {error}");

    let expired = Context::background().with_timeout(Duration::ZERO);
    let error =
        fixture.repo.checkout(&expired, test_config()).await.err().expect("checkout should fail");
    assert!(error.is_cancelled(), "unexpected error: {error}");

    let checkouts = fixture.repo.options().checkout_dir.clone();
    let leftovers = std::fs::read_dir(&checkouts).map(|entries| entries.count()).unwrap_or(0);
    assert_eq!(leftovers, 0);

    let error = fixture.repo.refresh(&cancelled).await.expect_err("refresh should fail");
    assert!(error.is_cancelled());
}

#[tokio::test]
async fn empty_remote_has_empty_history() {
    let temp = TempDir::new().unwrap();
    let remote = temp.path().join("empty.git");
    run_git(temp.path(), &["init", "--bare", "--initial-branch=master", path_str(&remote)]);

    let repo = Repo::new(path_str(&remote), RepoOptions::new(temp.path().join("cache")));
    repo.ensure_cloned(&ctx()).await.expect("empty remote should mirror");

    let commits = repo.commits_before(&ctx(), "HEAD").await.expect("empty history is not an error");
    assert!(commits.is_empty());

    repo.clean();
    assert!(!repo.dir().exists());
}

#[tokio::test]
async fn sync_loop_picks_up_remote_changes() {
    let fixture =
        Fixture::with_options(|options| options.poll_interval = Duration::from_secs(3600)).await;
    let mut refreshes = fixture.repo.subscribe_refreshes();
    let handle = fixture.repo.start();

    let checkout = fixture.checkout(test_config()).await;
    write_manifest(&checkout, MANIFESTS[0].0, "LOOP CHANGE");
    let pushed = checkout
        .commit_and_push::<Note>(&ctx(), &CommitAction::new("Loop"), None)
        .await
        .unwrap();

    // A refresh already in flight may predate the push; keep asking until
    // the mirror shows it.
    let caught_up = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            fixture.repo.notify();
            refreshes.changed().await.expect("repo should outlive the test");
            if fixture.repo.revision(&ctx(), "refs/heads/master").await.unwrap() == pushed {
                break;
            }
        }
    })
    .await;

    assert!(caught_up.is_ok(), "mirror never observed the push");
    assert!(fixture.repo.last_refreshed().is_some());

    handle.shutdown().await;
    checkout.clean();
}

#[tokio::test]
async fn signed_commit_records_signing_key() {
    let temp = TempDir::new().unwrap();
    let Some((gpg_home, key)) = gpg_key(temp.path()) else {
        eprintln!("gpg unavailable, skipping signed commit test");
        return;
    };

    let home = gpg_home.clone();
    let fixture = Fixture::with_options(move |options| options.gpg_home = Some(home)).await;
    let winner = fixture.checkout(test_config()).await;
    let checkout = fixture.checkout(test_config()).await;

    // Land an unrelated commit first so the signed push is rebased.
    write_manifest(&winner, MANIFESTS[1].0, "WINNER CHANGE");
    let winner_rev = winner
        .commit_and_push::<Note>(&ctx(), &CommitAction::new("Winner"), None)
        .await
        .unwrap();

    write_manifest(&checkout, MANIFESTS[0].0, "SIGNED CHANGE");
    let action =
        CommitAction::new("Changed file").with_signing_key(key.clone(), Some(gpg_home.clone()));
    let landed = checkout
        .commit_and_push::<Note>(&ctx(), &action, None)
        .await
        .expect("signed push should succeed");

    fixture.repo.refresh(&ctx()).await.unwrap();
    let commits = fixture.repo.commits_before(&ctx(), "HEAD").await.unwrap();
    assert_eq!(commits[0].revision, landed);
    assert_eq!(commits[1].revision, winner_rev);
    let recorded = commits[0].signing_key.clone().expect("head commit should be signed");
    assert_eq!(&recorded[recorded.len() - 16..], &key[key.len() - 16..]);
    assert!(commits[0].is_signed_by(&key));

    winner.clean();
    checkout.clean();
    let _ = Command::new("gpgconf")
        .env("GNUPGHOME", &gpg_home)
        .args(["--kill", "gpg-agent"])
        .output();
}

/// Generate a throwaway signing key. `None` when gpg is missing or cannot
/// create keys in this environment.
fn gpg_key(base: &Path) -> Option<(PathBuf, String)> {
    let home = base.join("gnupg");
    std::fs::create_dir_all(&home).ok()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&home, std::fs::Permissions::from_mode(0o700)).ok()?;
    }

    let gpg = |args: &[&str]| {
        Command::new("gpg")
            .env("GNUPGHOME", &home)
            .args(["--batch", "--pinentry-mode", "loopback", "--passphrase", ""])
            .args(args)
            .output()
            .ok()
            .filter(|output| output.status.success())
    };

    gpg(&["--quick-generate-key", "Flux Test <flux@example.com>", "default", "sign", "never"])?;
    let listing = gpg(&["--with-colons", "--list-secret-keys"])?;
    let listing = String::from_utf8(listing.stdout).ok()?;
    let fingerprint = listing
        .lines()
        .find(|line| line.starts_with("fpr:"))
        .and_then(|line| line.split(':').nth(9))
        .map(str::to_string)?;
    Some((home, fingerprint))
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf8 path")
}

fn run_git(cwd: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("git command should run");
    assert!(
        output.status.success(),
        "git {:?} failed:\nstdout: {}\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn run_git_capture(cwd: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("git command should run");
    assert!(
        output.status.success(),
        "git {:?} failed:\nstdout: {}\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("utf8 output")
}
