//! Storage records built from API responses

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::github::{CommitDetail, CommitFile, RepoDetail};

/// Paths that count as test code
static TEST_PATH: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(^test|[^a-zA-Z]+test|Test)"));

/// Whether a file path looks like test code
pub fn is_test_path(path: &str) -> Result<bool, regex::Error> {
    match &*TEST_PATH {
        Ok(re) => Ok(re.is_match(path)),
        Err(e) => Err(e.clone()),
    }
}

/// Row in `repos`, keyed by `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRecord {
    pub id: i64,
    pub owner_login: Option<String>,
    pub owner_id: Option<i64>,
    pub name: Option<String>,
    pub full_name: Option<String>,
    pub language: Option<String>,
    pub forks_count: Option<i64>,
    pub stargazers_count: Option<i64>,
    pub watchers_count: Option<i64>,
    pub subscribers_count: Option<i64>,
    pub size: Option<i64>,
    pub has_issues: Option<bool>,
    pub has_wiki: Option<bool>,
    pub has_pages: Option<bool>,
    pub has_downloads: Option<bool>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RepoRecord {
    /// Build a record, or `None` for forks and repositories without an id
    pub fn from_detail(detail: &RepoDetail) -> Option<Self> {
        if detail.fork {
            return None;
        }
        let id = detail.id?;
        let owner = detail.owner.clone().unwrap_or_default();

        Some(Self {
            id,
            owner_login: owner.login,
            owner_id: owner.id,
            name: detail.name.clone(),
            full_name: detail.full_name.clone(),
            language: detail.language.clone(),
            forks_count: detail.forks_count,
            stargazers_count: detail.stargazers_count,
            watchers_count: detail.watchers_count,
            subscribers_count: detail.subscribers_count,
            size: detail.size,
            has_issues: detail.has_issues,
            has_wiki: detail.has_wiki,
            has_pages: detail.has_pages,
            has_downloads: detail.has_downloads,
            pushed_at: detail.pushed_at,
            created_at: detail.created_at,
            updated_at: detail.updated_at,
        })
    }
}

/// Additions, deletions and changes summed over test files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestChurn {
    pub additions: i64,
    pub deletions: i64,
    pub changes: i64,
}

impl TestChurn {
    pub fn from_files(files: &[CommitFile]) -> Result<Self, regex::Error> {
        let mut churn = TestChurn::default();
        for file in files {
            let Some(name) = file.filename.as_deref() else {
                continue;
            };
            if is_test_path(name)? {
                churn.additions += file.additions;
                churn.deletions += file.deletions;
                churn.changes += file.changes;
            }
        }
        Ok(churn)
    }
}

/// Row in `commits`, keyed by `sha`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub sha: String,
    pub repo_id: i64,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub author_date: Option<DateTime<Utc>>,
    pub committer_name: Option<String>,
    pub committer_email: Option<String>,
    pub committer_date: Option<DateTime<Utc>>,
    pub author_login: Option<String>,
    pub author_id: Option<i64>,
    pub committer_login: Option<String>,
    pub committer_id: Option<i64>,
    pub additions: Option<i64>,
    pub deletions: Option<i64>,
    pub total: Option<i64>,
    pub test_additions: Option<i64>,
    pub test_deletions: Option<i64>,
    pub test_changes: Option<i64>,
}

impl CommitRecord {
    /// Build a record, or `None` when the response has no sha
    ///
    /// Test churn is left empty when the response lists no files or the
    /// test path pattern cannot be compiled.
    pub fn from_detail(repo_id: i64, detail: &CommitDetail) -> Option<Self> {
        let sha = detail.sha.clone()?;
        let git = detail.commit.clone().unwrap_or_default();
        let git_author = git.author.unwrap_or_default();
        let git_committer = git.committer.unwrap_or_default();
        let author = detail.author.clone().unwrap_or_default();
        let committer = detail.committer.clone().unwrap_or_default();
        let stats = detail.stats.clone().unwrap_or_default();
        let churn = match detail.files.as_deref().map(TestChurn::from_files).transpose() {
            Ok(churn) => churn,
            Err(e) => {
                error!(sha = %sha, error = %e, "invalid test path pattern, test churn left empty");
                None
            }
        };

        Some(Self {
            sha,
            repo_id,
            author_name: git_author.name,
            author_email: git_author.email,
            author_date: git_author.date,
            committer_name: git_committer.name,
            committer_email: git_committer.email,
            committer_date: git_committer.date,
            author_login: author.login,
            author_id: author.id,
            committer_login: committer.login,
            committer_id: committer.id,
            additions: stats.additions,
            deletions: stats.deletions,
            total: stats.total,
            test_additions: churn.map(|c| c.additions),
            test_deletions: churn.map(|c| c.deletions),
            test_changes: churn.map(|c| c.changes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::{Account, CommitStats};

    fn file(name: &str, additions: i64, deletions: i64, changes: i64) -> CommitFile {
        CommitFile {
            filename: Some(name.to_string()),
            additions,
            deletions,
            changes,
        }
    }

    #[test]
    fn test_path_pattern_compiles() {
        assert!(TEST_PATH.is_ok());
    }

    #[test]
    fn test_path_classification() {
        assert!(is_test_path("test_foo.py").unwrap());
        assert!(is_test_path("src/test/Main.java").unwrap());
        assert!(is_test_path("lib/foo_test.go").unwrap());
        assert!(is_test_path("FooTest.java").unwrap());
        assert!(!is_test_path("src/main.py").unwrap());
        assert!(!is_test_path("contest.rs").unwrap());
        assert!(!is_test_path("README.md").unwrap());
    }

    #[test]
    fn test_churn_counts_only_test_files() {
        let churn = TestChurn::from_files(&[
            file("src/main.py", 10, 2, 12),
            file("test_foo.py", 5, 1, 6),
        ])
        .unwrap();
        assert_eq!(
            churn,
            TestChurn {
                additions: 5,
                deletions: 1,
                changes: 6
            }
        );
    }

    #[test]
    fn test_fork_is_not_recorded() {
        let detail = RepoDetail {
            id: Some(5),
            fork: true,
            ..Default::default()
        };
        assert!(RepoRecord::from_detail(&detail).is_none());

        let no_id = RepoDetail::default();
        assert!(RepoRecord::from_detail(&no_id).is_none());
    }

    #[test]
    fn test_repo_record_copies_owner() {
        let detail = RepoDetail {
            id: Some(5),
            name: Some("grit".into()),
            owner: Some(Account {
                login: Some("mojombo".into()),
                id: Some(1),
            }),
            stargazers_count: Some(1900),
            ..Default::default()
        };

        let record = RepoRecord::from_detail(&detail).unwrap();
        assert_eq!(record.id, 5);
        assert_eq!(record.owner_login.as_deref(), Some("mojombo"));
        assert_eq!(record.owner_id, Some(1));
        assert_eq!(record.stargazers_count, Some(1900));
    }

    #[test]
    fn test_commit_record_without_files_has_no_churn() {
        let detail = CommitDetail {
            sha: Some("abc".into()),
            stats: Some(CommitStats {
                additions: Some(3),
                deletions: Some(1),
                total: Some(4),
            }),
            ..Default::default()
        };

        let record = CommitRecord::from_detail(9, &detail).unwrap();
        assert_eq!(record.repo_id, 9);
        assert_eq!(record.total, Some(4));
        assert_eq!(record.test_additions, None);
        assert!(CommitRecord::from_detail(9, &CommitDetail::default()).is_none());
    }
}
