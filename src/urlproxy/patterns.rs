//! The URL-pattern table shared by the generic URL proxy (admission +
//! redirect-rewrite decisions) and the script rewriter, which prefixes every
//! matched URL it finds inside a `.sh` body.
//!
//! Patterns are unanchored so the same table supports both "does this whole
//! URL match" (checked via `match.start() == 0`) and "find every occurrence
//! inside a larger text" (via `find_iter`).

use regex::Regex;
use std::sync::OnceLock;

pub struct Pattern {
    pub name: &'static str,
    pub regex: Regex,
    /// Capture group indices for `(user, repo)`, when the host encodes them.
    pub user_repo_groups: Option<(usize, usize)>,
}

fn build_table() -> Vec<Pattern> {
    let specs: &[(&str, &str, Option<(usize, usize)>)] = &[
        (
            "github_releases",
            r"https://github\.com/([^/\s]+)/([^/\s]+)/releases/\S*",
            Some((1, 2)),
        ),
        (
            "github_archive",
            r"https://github\.com/([^/\s]+)/([^/\s]+)/archive/\S*",
            Some((1, 2)),
        ),
        (
            "github_blob",
            r"https://github\.com/([^/\s]+)/([^/\s]+)/blob/\S*",
            Some((1, 2)),
        ),
        (
            "github_raw",
            r"https://github\.com/([^/\s]+)/([^/\s]+)/raw/\S*",
            Some((1, 2)),
        ),
        (
            "github_info_refs",
            r"https://github\.com/([^/\s]+)/([^/\s]+)\.git/info/refs\S*",
            Some((1, 2)),
        ),
        (
            "github_git_protocol",
            r"https://github\.com/([^/\s]+)/([^/\s]+)\.git/git-(?:upload|receive)-pack\S*",
            Some((1, 2)),
        ),
        (
            "raw_githubusercontent",
            r"https://raw\.githubusercontent\.com/([^/\s]+)/([^/\s]+)/\S*",
            Some((1, 2)),
        ),
        (
            "gist_github",
            r"https://gist\.github(?:usercontent)?\.com/([^/\s]+)/\S*",
            None,
        ),
        (
            "api_github_repos",
            r"https://api\.github\.com/repos/([^/\s]+)/([^/\s]+)\S*",
            Some((1, 2)),
        ),
        (
            "huggingface",
            r"https://huggingface\.co/([^/\s]+)/([^/\s]+)\S*",
            Some((1, 2)),
        ),
        ("hf_cdn_lfs", r"https://cdn-lfs\.hf\.co/\S*", None),
        (
            "docker_download",
            r"https://download\.docker\.com/\S*?\.(?:tgz|zip)",
            None,
        ),
        (
            "github_assets",
            r"https://(?:github|opengraph\.githubassets)\.com/\S*",
            None,
        ),
    ];

    specs
        .iter()
        .map(|(name, pattern, groups)| Pattern {
            name,
            regex: Regex::new(pattern).expect("static pattern must compile"),
            user_repo_groups: *groups,
        })
        .collect()
}

pub fn table() -> &'static [Pattern] {
    static TABLE: OnceLock<Vec<Pattern>> = OnceLock::new();
    TABLE.get_or_init(build_table)
}

/// Whole-URL admission check for C7: the first pattern whose match starts at
/// offset 0 and its `(user, repo)` capture, if the host encodes one.
pub fn match_url(url: &str) -> Option<(&'static Pattern, Option<(String, String)>)> {
    for pattern in table() {
        if let Some(m) = pattern.regex.find(url) {
            if m.start() != 0 {
                continue;
            }
            let caps = pattern.regex.captures(url)?;
            let user_repo = pattern.user_repo_groups.and_then(|(u, r)| {
                Some((caps.get(u)?.as_str().to_string(), caps.get(r)?.as_str().to_string()))
            });
            return Some((pattern, user_repo));
        }
    }
    None
}

/// Every non-overlapping match of any table pattern inside `text`, sorted by
/// start offset, used by the script rewriter to find URLs to prefix.
pub fn find_all(text: &str) -> Vec<(std::ops::Range<usize>, &'static str)> {
    let mut spans: Vec<(std::ops::Range<usize>, &'static str)> = Vec::new();
    for pattern in table() {
        for m in pattern.regex.find_iter(text) {
            spans.push((m.start()..m.end(), pattern.name));
        }
    }
    spans.sort_by_key(|(range, _)| range.start);

    let mut out: Vec<(std::ops::Range<usize>, &'static str)> = Vec::new();
    let mut last_end = 0usize;
    for (range, name) in spans {
        if range.start < last_end {
            continue; // drop overlaps with an earlier, already-accepted match
        }
        last_end = range.end;
        out.push((range, name));
    }
    out
}

/// The single regex that drives the `blob` → `raw` GitHub rewrite.
pub fn rewrite_blob_to_raw(url: &str) -> Option<String> {
    static BLOB_RE: OnceLock<Regex> = OnceLock::new();
    let re = BLOB_RE.get_or_init(|| Regex::new(r"^(https://github\.com/[^/]+/[^/]+)/blob/").unwrap());
    if re.is_match(url) {
        Some(re.replace(url, "$1/raw/").to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_github_releases_matches_and_captures() {
        let (pattern, ur) = match_url("https://github.com/user/repo/releases/download/v1/x.tar.gz").unwrap();
        assert_eq!(pattern.name, "github_releases");
        assert_eq!(ur, Some(("user".to_string(), "repo".to_string())));
    }

    #[test]
    fn test_raw_githubusercontent_matches() {
        let (pattern, ur) = match_url("https://raw.githubusercontent.com/user/repo/main/install.sh").unwrap();
        assert_eq!(pattern.name, "raw_githubusercontent");
        assert_eq!(ur, Some(("user".to_string(), "repo".to_string())));
    }

    #[test]
    fn test_huggingface_matches() {
        let (pattern, ur) = match_url("https://huggingface.co/org/model/resolve/main/config.json").unwrap();
        assert_eq!(pattern.name, "huggingface");
        assert_eq!(ur, Some(("org".to_string(), "model".to_string())));
    }

    #[test]
    fn test_docker_download_no_capture() {
        let (pattern, ur) = match_url("https://download.docker.com/linux/static/stable/x86_64/docker-24.0.0.tgz").unwrap();
        assert_eq!(pattern.name, "docker_download");
        assert_eq!(ur, None);
    }

    #[test]
    fn test_ftp_url_matches_nothing() {
        assert!(match_url("ftp://example.com/file").is_none());
    }

    #[test]
    fn test_blob_to_raw_rewrite() {
        let rewritten = rewrite_blob_to_raw("https://github.com/user/repo/blob/main/install.sh").unwrap();
        assert_eq!(rewritten, "https://github.com/user/repo/raw/main/install.sh");
    }

    #[test]
    fn test_blob_to_raw_rewrite_none_for_non_blob() {
        assert!(rewrite_blob_to_raw("https://github.com/user/repo/raw/main/install.sh").is_none());
    }

    #[test]
    fn test_find_all_locates_embedded_url() {
        let text = "curl -sL https://raw.githubusercontent.com/user/repo/main/install.sh | sh";
        let spans = find_all(text);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].1, "raw_githubusercontent");
    }

    #[test]
    fn test_find_all_multiple_non_overlapping() {
        let text = "https://github.com/a/b/releases/x and https://huggingface.co/c/d/resolve/y";
        let spans = find_all(text);
        assert_eq!(spans.len(), 2);
    }
}
