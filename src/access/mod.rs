//! Stateless allow/deny matching for image references and GitHub repos.
//!
//! Both predicates share one pattern grammar: exact `ns/repo`, whole-namespace
//! `ns` or `ns/*`, prefix `prefix*`, repo-only wildcard `*/repo` or `*/repo*`,
//! and subtree `prefix/`. Matching is case-insensitive throughout.

/// Outcome of a list check, carrying a human-readable reason for denial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Parsed `namespace/repository` (or `user/repo` for GitHub) full name used
/// as the subject of a list check.
pub struct FullName<'a> {
    pub namespace: &'a str,
    pub repository: &'a str,
}

impl<'a> FullName<'a> {
    pub fn new(namespace: &'a str, repository: &'a str) -> Self {
        Self {
            namespace,
            repository,
        }
    }

    fn full(&self) -> String {
        format!("{}/{}", self.namespace, self.repository).to_lowercase()
    }
}

/// `CheckImage`/`CheckGitHub` share this core: if the allow-list is non-empty,
/// the name must match an entry or the request is denied; the deny-list is
/// then consulted regardless. Empty lists are permissive at that stage.
pub fn check(name: &FullName, white_list: &[String], black_list: &[String]) -> Decision {
    let full = name.full();

    if !white_list.is_empty() && !list_matches(white_list, &full) {
        return Decision::Deny("不在白名单内".to_string());
    }

    if list_matches(black_list, &full) {
        return Decision::Deny("在黑名单内".to_string());
    }

    Decision::Allow
}

pub fn check_image(image_ref: &crate::registry::ImageRef, white_list: &[String], black_list: &[String]) -> Decision {
    check(
        &FullName::new(&image_ref.namespace, &image_ref.repository),
        white_list,
        black_list,
    )
}

pub fn check_github(user: &str, repo: &str, white_list: &[String], black_list: &[String]) -> Decision {
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    check(&FullName::new(user, repo), white_list, black_list)
}

fn list_matches(list: &[String], full: &str) -> bool {
    list.iter().any(|entry| pattern_matches(entry, full))
}

/// A single entry's match against a lowercased `namespace/repository` string.
fn pattern_matches(entry: &str, full: &str) -> bool {
    let entry = entry.to_lowercase();

    // subtree: "prefix/" matches iff full-name starts with "prefix/"
    if let Some(prefix) = entry.strip_suffix('/') {
        if !prefix.contains('*') {
            return full.starts_with(&format!("{prefix}/"));
        }
    }

    // repo-only wildcard: "*/repo" or "*/repo*"
    if let Some(rest) = entry.strip_prefix("*/") {
        return match rest.strip_suffix('*') {
            Some(repo_prefix) => full
                .split_once('/')
                .is_some_and(|(_, repo)| repo.starts_with(repo_prefix)),
            None => full.split_once('/').is_some_and(|(_, repo)| repo == rest),
        };
    }

    // namespace-wide: "ns" or "ns/*"
    if let Some(ns) = entry.strip_suffix("/*") {
        return full.split_once('/').is_some_and(|(namespace, _)| namespace == ns);
    }
    if !entry.contains('/') && !entry.contains('*') {
        return full.split_once('/').is_some_and(|(namespace, _)| namespace == entry);
    }

    // prefix wildcard over the whole full-name: "prefix*"
    if let Some(prefix) = entry.strip_suffix('*') {
        return full.starts_with(prefix);
    }

    // exact "ns/repo"
    full == entry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fn_<'a>(ns: &'a str, repo: &'a str) -> FullName<'a> {
        FullName::new(ns, repo)
    }

    #[test]
    fn test_exact_match() {
        let white = vec!["library/nginx".to_string()];
        assert_eq!(check(&fn_("library", "nginx"), &white, &[]), Decision::Allow);
        assert!(!check(&fn_("library", "redis"), &white, &[]).is_allow());
    }

    #[test]
    fn test_namespace_wildcard() {
        let white = vec!["library/*".to_string()];
        assert!(check(&fn_("library", "redis"), &white, &[]).is_allow());
        assert!(!check(&fn_("bitnami", "redis"), &white, &[]).is_allow());

        let white2 = vec!["library".to_string()];
        assert!(check(&fn_("library", "redis"), &white2, &[]).is_allow());
    }

    #[test]
    fn test_prefix_wildcard() {
        let white = vec!["lib*".to_string()];
        assert!(check(&fn_("library", "redis"), &white, &[]).is_allow());
        assert!(!check(&fn_("bitnami", "redis"), &white, &[]).is_allow());
    }

    #[test]
    fn test_repo_only_wildcard() {
        let white = vec!["*/nginx".to_string()];
        assert!(check(&fn_("library", "nginx"), &white, &[]).is_allow());
        assert!(!check(&fn_("library", "redis"), &white, &[]).is_allow());

        let white2 = vec!["*/ngin*".to_string()];
        assert!(check(&fn_("bitnami", "nginx"), &white2, &[]).is_allow());
    }

    #[test]
    fn test_subtree() {
        let white = vec!["library/".to_string()];
        assert!(check(&fn_("library", "nginx"), &white, &[]).is_allow());
        assert!(!check(&fn_("libraryx", "nginx"), &white, &[]).is_allow());
    }

    #[test]
    fn test_empty_lists_permissive() {
        assert!(check(&fn_("anything", "goes"), &[], &[]).is_allow());
    }

    #[test]
    fn test_black_list_after_white_list_pass() {
        let white = vec!["library/*".to_string()];
        let black = vec!["library/nginx".to_string()];
        assert!(!check(&fn_("library", "nginx"), &white, &black).is_allow());
        assert!(check(&fn_("library", "redis"), &white, &black).is_allow());
    }

    #[test]
    fn test_case_insensitive() {
        let white = vec!["Library/Nginx".to_string()];
        assert!(check(&fn_("library", "nginx"), &white, &[]).is_allow());
    }

    #[test]
    fn test_github_strips_dot_git_suffix() {
        let white = vec!["octocat/hello-world".to_string()];
        assert!(check_github("octocat", "hello-world.git", &white, &[]).is_allow());
    }
}
