//! CI build metadata and reporting restrictions.

use anyhow::{Result, anyhow};
use tracing::{info, warn};

use crate::io::config::ReporterConfig;
use crate::io::git::Git;
use crate::io::remote::CaseUpdate;

pub const AUTOMATED_LABEL: &str = "automated";

/// Build metadata attached to reported test cases.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CiInfo {
    /// Local user, lowercased. Used as executor and assignee.
    pub user: String,
    pub build_url: Option<String>,
    pub code_base: Option<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
}

impl CiInfo {
    /// Collect metadata from `lookup` (usually the process environment).
    ///
    /// `code_base_fallback` is consulted when `GIT_URL` is not set.
    pub fn collect<F, G>(lookup: F, code_base_fallback: G) -> Self
    where
        F: Fn(&str) -> Option<String>,
        G: FnOnce() -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());
        let user = ["LOGNAME", "USER", "LNAME", "USERNAME"]
            .iter()
            .find_map(|key| non_empty(key))
            .unwrap_or_default()
            .to_lowercase();

        let build_url = non_empty("BUILD_URL")
            .map(|url| normalize_build_url(&url, non_empty("JENKINS_URL").as_deref()));
        let code_base = non_empty("GIT_URL")
            .or_else(code_base_fallback)
            .map(|url| normalize_code_base(&url));

        Self {
            user,
            build_url,
            code_base,
            branch: non_empty("GIT_BRANCH"),
            commit: non_empty("GIT_COMMIT"),
        }
    }

    /// Collect from the process environment, falling back to the git remote of the cwd.
    pub fn from_env() -> Self {
        Self::collect(
            |key| std::env::var(key).ok(),
            || match Git::new(".").remote_origin_url() {
                Ok(url) => url,
                Err(err) => {
                    warn!(err = %err, "could not query git remote");
                    None
                }
            },
        )
    }

    /// Traceability fields pushed onto a reported test case.
    pub fn case_update(&self) -> CaseUpdate {
        let link = |url: &Option<String>| match url {
            Some(url) => format!("<a href=\"{url}\">{url}</a>"),
            None => String::new(),
        };
        CaseUpdate {
            labels: vec![AUTOMATED_LABEL.to_string()],
            build_urls: vec![link(&self.build_url)],
            code_bases: vec![link(&self.code_base)],
        }
    }
}

/// Shorten a Jenkins build URL to its job URL.
pub fn normalize_build_url(build_url: &str, jenkins_url: Option<&str>) -> String {
    match jenkins_url {
        Some(jenkins) if build_url.starts_with(jenkins) => {
            build_url.split('/').take(5).collect::<Vec<_>>().join("/")
        }
        _ => build_url.to_string(),
    }
}

/// Turn `git@host:org/repo.git` into `https://host/org/repo`.
pub fn normalize_code_base(code_base: &str) -> String {
    if !code_base.starts_with("git@") {
        return code_base.to_string();
    }
    code_base
        .replace(':', "/")
        .replace(".git", "")
        .replace("git@", "https://")
}

/// Decide whether this session may report.
///
/// A configured `restrict_user` other than the local user silently disables
/// reporting. A configured branch restriction is a hard error on any other branch.
pub fn reporting_allowed(cfg: &ReporterConfig, ci: &CiInfo) -> Result<bool> {
    if let Some(user) = cfg.restrict_user.as_deref()
        && user != ci.user
    {
        info!(restrict_user = user, user = %ci.user, "reporting restricted to another user");
        return Ok(false);
    }
    if cfg.restrict_branch {
        let branch = ci.branch.as_deref().unwrap_or_default();
        if branch != cfg.restrict_branch_name {
            return Err(anyhow!(
                "The branch \"{branch}\" cannot be used to report as reporting is restricted to \"{}\" by configuration.",
                cfg.restrict_branch_name
            ));
        }
    }
    Ok(cfg.enabled)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn jenkins_build_urls_are_cut_to_the_job() {
        assert_eq!(
            normalize_build_url(
                "https://ci.example.com/job/nightly/42/console",
                Some("https://ci.example.com/")
            ),
            "https://ci.example.com/job/nightly"
        );
        assert_eq!(
            normalize_build_url("https://other/job/x/1", Some("https://ci.example.com/")),
            "https://other/job/x/1"
        );
    }

    #[test]
    fn ssh_code_bases_become_https() {
        assert_eq!(
            normalize_code_base("git@github.com:team/repo.git"),
            "https://github.com/team/repo"
        );
        assert_eq!(
            normalize_code_base("https://github.com/team/repo"),
            "https://github.com/team/repo"
        );
    }

    /// `GIT_URL` wins over the git remote fallback.
    #[test]
    fn collect_prefers_environment() {
        let vars = env(&[("USER", "Alice"), ("GIT_URL", "https://git/repo")]);
        let ci = CiInfo::collect(|k| vars.get(k).cloned(), || Some("unused".to_string()));
        assert_eq!(ci.user, "alice");
        assert_eq!(ci.code_base.as_deref(), Some("https://git/repo"));
        assert_eq!(ci.build_url, None);

        let ci = CiInfo::collect(|_| None, || Some("git@host:org/r.git".to_string()));
        assert_eq!(ci.code_base.as_deref(), Some("https://host/org/r"));
    }

    #[test]
    fn case_update_links_urls() {
        let ci = CiInfo {
            build_url: Some("https://ci/job/x".to_string()),
            ..CiInfo::default()
        };
        let update = ci.case_update();
        assert_eq!(update.labels, vec![AUTOMATED_LABEL]);
        assert_eq!(
            update.build_urls,
            vec!["<a href=\"https://ci/job/x\">https://ci/job/x</a>"]
        );
        assert_eq!(update.code_bases, vec![""]);
    }

    #[test]
    fn other_user_disables_reporting() {
        let cfg = ReporterConfig {
            enabled: true,
            restrict_user: Some("jenkins".to_string()),
            ..ReporterConfig::default()
        };
        let ci = CiInfo {
            user: "alice".to_string(),
            ..CiInfo::default()
        };
        assert!(!reporting_allowed(&cfg, &ci).expect("allowed"));
    }

    #[test]
    fn wrong_branch_is_an_error() {
        let cfg = ReporterConfig {
            enabled: true,
            restrict_branch: true,
            ..ReporterConfig::default()
        };
        let ci = CiInfo {
            branch: Some("origin/feature".to_string()),
            ..CiInfo::default()
        };
        let err = reporting_allowed(&cfg, &ci).expect_err("restricted");
        assert!(err.to_string().contains("restricted to \"origin/master\""));

        let ci = CiInfo {
            branch: Some("origin/master".to_string()),
            ..CiInfo::default()
        };
        assert!(reporting_allowed(&cfg, &ci).expect("allowed"));
    }
}
