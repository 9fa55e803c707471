use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

/// `refname|date|commit|subject`. [`parse_ref_line`] depends on this order.
pub const REF_FORMAT: &str =
    "%(refname)|%(committerdate:iso-strict)|%(objectname:short)|%(contents:subject)";

const MAX_BRANCH_NAME_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub commit: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub remote_commit: Option<String>,
    #[serde(default)]
    pub remote_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remote_subject: Option<String>,
    pub is_local: bool,
    pub has_remote: bool,
    pub has_updates: bool,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub new_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub just_updated: bool,
}

impl Branch {
    fn local(record: RefRecord) -> Self {
        Self {
            name: record.name,
            commit: record.commit,
            subject: record.subject,
            date: record.date,
            remote_commit: None,
            remote_date: None,
            remote_subject: None,
            is_local: true,
            has_remote: false,
            has_updates: false,
            is_new: false,
            new_at: None,
            is_deleted: false,
            deleted_at: None,
            just_updated: false,
        }
    }

    fn remote_only(record: RefRecord) -> Self {
        Self {
            remote_commit: Some(record.commit.clone()),
            remote_date: Some(record.date),
            remote_subject: Some(record.subject.clone()),
            is_local: false,
            has_remote: true,
            ..Self::local(record)
        }
    }

    /// The newest commit known for this name, remote side first.
    pub fn tip(&self) -> &str {
        self.remote_commit.as_deref().unwrap_or(&self.commit)
    }
}

/// One parsed line of `for-each-ref` output, prefix not yet stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRecord {
    pub name: String,
    pub date: DateTime<Utc>,
    pub commit: String,
    pub subject: String,
}

fn branch_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._/+-]*$").expect("valid regex"))
}

/// Gate for every name that will be placed on a command line. No leading
/// dash, no whitespace or shell metacharacters, no `..` traversal.
pub fn validate_branch_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_BRANCH_NAME_LEN {
        return false;
    }
    if !branch_name_pattern().is_match(name) {
        return false;
    }
    !(name.contains("..")
        || name.contains("//")
        || name.contains("@{")
        || name.ends_with('/')
        || name.ends_with('.')
        || name.ends_with(".lock"))
}

pub fn parse_ref_line(line: &str) -> Option<RefRecord> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    let mut parts = line.splitn(4, '|');
    let name = parts.next()?.trim();
    let date = parts.next()?.trim();
    let commit = parts.next()?.trim();
    let subject = parts.next().unwrap_or("").to_string();
    if name.is_empty() || commit.is_empty() {
        return None;
    }
    let date = DateTime::parse_from_rfc3339(date)
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    Some(RefRecord {
        name: name.to_string(),
        date,
        commit: commit.to_string(),
        subject,
    })
}

pub fn parse_ref_listing(raw: &str) -> Vec<RefRecord> {
    raw.lines().filter_map(parse_ref_line).collect()
}

fn strip_local_prefix(name: &str) -> &str {
    name.strip_prefix("refs/heads/").unwrap_or(name)
}

/// Remote refs may come fully qualified or in short `origin/x` form.
fn strip_remote_prefix<'a>(name: &'a str, remote: &str) -> Option<&'a str> {
    let short = name.strip_prefix("refs/remotes/").unwrap_or(name);
    let rest = short.strip_prefix(remote)?.strip_prefix('/')?;
    Some(rest)
}

/// Builds the unified list: local entries first, remote entries merged in
/// by name, then sorted by date descending with name as the tie-break so
/// identical input always yields identical output.
pub fn reconcile(local_raw: &str, remote_raw: &str, remote: &str) -> Vec<Branch> {
    let mut branches: Vec<Branch> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for mut record in parse_ref_listing(local_raw) {
        let name = strip_local_prefix(&record.name).to_string();
        if !validate_branch_name(&name) {
            debug!(name = %name, "skip_invalid_local_ref");
            continue;
        }
        if index.contains_key(&name) {
            continue;
        }
        record.name = name.clone();
        index.insert(name, branches.len());
        branches.push(Branch::local(record));
    }

    for mut record in parse_ref_listing(remote_raw) {
        let Some(name) = strip_remote_prefix(&record.name, remote) else {
            continue;
        };
        if name == "HEAD" || name.is_empty() {
            continue;
        }
        if !validate_branch_name(name) {
            debug!(name = %name, "skip_invalid_remote_ref");
            continue;
        }
        let name = name.to_string();
        match index.get(&name) {
            Some(&position) => {
                let entry = &mut branches[position];
                if entry.has_remote {
                    continue;
                }
                entry.has_remote = true;
                entry.has_updates = entry.commit != record.commit;
                if entry.has_updates {
                    entry.date = record.date;
                    entry.subject = record.subject.clone();
                }
                entry.remote_commit = Some(record.commit);
                entry.remote_date = Some(record.date);
                entry.remote_subject = Some(record.subject);
            }
            None => {
                record.name = name.clone();
                index.insert(name, branches.len());
                branches.push(Branch::remote_only(record));
            }
        }
    }

    sort_by_activity(&mut branches);
    branches
}

pub fn sort_by_activity(branches: &mut [Branch]) {
    branches.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.name.cmp(&b.name)));
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: &str = "refs/heads/main|2024-05-01T10:00:00+00:00|aaa1111|Initial import\n\
refs/heads/feature-a|2024-05-02T09:00:00+00:00|bbb2222|Add feature a\n";

    const REMOTE: &str = "refs/remotes/origin/HEAD|2024-05-03T08:00:00+00:00|ccc3333|Bump deps\n\
refs/remotes/origin/main|2024-05-03T08:00:00+00:00|ccc3333|Bump deps\n\
refs/remotes/origin/feature-a|2024-05-02T09:00:00+00:00|bbb2222|Add feature a\n\
refs/remotes/origin/feature-b|2024-05-04T12:00:00+00:00|ddd4444|Start feature b\n";

    #[test]
    fn rejects_unsafe_names() {
        for name in [
            "",
            "-rf",
            "../etc",
            "a..b",
            "has space",
            "semi;colon",
            "back`tick",
            "$(whoami)",
            "trailing/",
            "double//slash",
            "ref@{1}",
            "dir/name.lock",
            "ends.",
        ] {
            assert!(!validate_branch_name(name), "{name:?} should be rejected");
        }
        assert!(!validate_branch_name(&"x".repeat(256)));
    }

    #[test]
    fn accepts_ordinary_names() {
        for name in ["main", "feature/login-form", "release-1.2.3", "user+fix", "_wip"] {
            assert!(validate_branch_name(name), "{name:?} should be accepted");
        }
    }

    #[test]
    fn parses_subject_containing_delimiter() {
        let record = parse_ref_line("refs/heads/x|2024-01-01T00:00:00Z|abc|fix: a|b split").expect("record");
        assert_eq!(record.subject, "fix: a|b split");
        assert_eq!(record.commit, "abc");
    }

    #[test]
    fn bad_date_falls_back_to_epoch() {
        let record = parse_ref_line("refs/heads/x|yesterday|abc|s").expect("record");
        assert_eq!(record.date, DateTime::<Utc>::UNIX_EPOCH);
        assert!(parse_ref_line("   ").is_none());
        assert!(parse_ref_line("only-a-name").is_none());
    }

    #[test]
    fn merges_local_and_remote_by_name() {
        let branches = reconcile(LOCAL, REMOTE, "origin");
        let names: Vec<_> = branches.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["feature-b", "main", "feature-a"]);

        let main = &branches[1];
        assert!(main.is_local && main.has_remote && main.has_updates);
        assert_eq!(main.commit, "aaa1111");
        assert_eq!(main.remote_commit.as_deref(), Some("ccc3333"));
        assert_eq!(main.subject, "Bump deps");
        assert_eq!(main.tip(), "ccc3333");

        let feature_a = &branches[2];
        assert!(!feature_a.has_updates);
        assert_eq!(feature_a.subject, "Add feature a");

        let feature_b = &branches[0];
        assert!(!feature_b.is_local && feature_b.has_remote);
    }

    #[test]
    fn synthetic_head_and_foreign_remotes_are_excluded() {
        let remote = "refs/remotes/origin/HEAD|2024-05-03T08:00:00Z|c|x\n\
refs/remotes/upstream/other|2024-05-03T08:00:00Z|d|y\n\
origin/short-form|2024-05-03T08:00:00Z|e|z\n";
        let branches = reconcile("", remote, "origin");
        let names: Vec<_> = branches.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["short-form"]);
    }

    #[test]
    fn reconciliation_is_idempotent() {
        let first = reconcile(LOCAL, REMOTE, "origin");
        let second = reconcile(LOCAL, REMOTE, "origin");
        assert_eq!(first, second);
        let mut names: Vec<_> = first.iter().map(|b| b.name.clone()).collect();
        names.dedup();
        assert_eq!(names.len(), first.len());
    }

    #[test]
    fn equal_dates_order_by_name() {
        let local = "refs/heads/zeta|2024-01-01T00:00:00Z|1|a\nrefs/heads/alpha|2024-01-01T00:00:00Z|2|b\n";
        let branches = reconcile(local, "", "origin");
        assert_eq!(branches[0].name, "alpha");
        assert_eq!(branches[1].name, "zeta");
    }
}
