use std::sync::OnceLock;

use regex::Regex;

static PROJECT_PATH_RE: OnceLock<Regex> = OnceLock::new();

fn project_path_re() -> &'static Regex {
    PROJECT_PATH_RE.get_or_init(|| {
        Regex::new(r"/projects/([A-Za-z0-9][A-Za-z0-9_-]*)").expect("static project regex")
    })
}

/// Pull the project identifier out of a project page URL
/// (`https://host/projects/<id>[/...]`).
pub fn extract_project_id(url: &str) -> Option<String> {
    project_path_re()
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

const ID_PATTERN: &str = "([A-Za-z0-9][A-Za-z0-9_-]*)";

/// Recognises project page URLs on one site and pulls out the id.
#[derive(Debug, Clone)]
pub struct ProjectUrlMatcher {
    re: Regex,
}

impl ProjectUrlMatcher {
    /// Project pages under `projects_path` on exactly `base_url`.
    pub fn for_site(base_url: &str, projects_path: &str) -> std::result::Result<Self, String> {
        let pattern = format!(
            "^{}{}/{}",
            regex::escape(base_url.trim_end_matches('/')),
            regex::escape(projects_path.trim_end_matches('/')),
            ID_PATTERN
        );
        Self::from_pattern(&pattern)
    }

    /// A caller-supplied pattern; its first capture group is the id.
    pub fn from_pattern(pattern: &str) -> std::result::Result<Self, String> {
        let re = Regex::new(pattern).map_err(|e| e.to_string())?;
        if re.captures_len() < 2 {
            return Err("pattern needs a capture group for the project id".to_string());
        }
        Ok(Self { re })
    }

    pub fn project_id(&self, url: &str) -> Option<String> {
        self.re
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|id| is_valid_project_id(id))
    }
}

/// Project ids end up inside URLs and selectors, so only a conservative
/// character set is accepted.
pub fn is_valid_project_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
