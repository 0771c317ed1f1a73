use std::borrow::Cow;
use std::fmt;

/// A compiled `pathPattern`.
///
/// Supports:
/// - Exact paths: "/about"
/// - Prefix globs: "/api/*"
/// - Suffix globs: "*.php" (a lone "*" matches every path)
///
/// Patterns with a `*` anywhere else are compared literally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathPattern {
    Exact(String),
    Prefix(String),
    Suffix(String),
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        if let Some(stripped) = pattern.strip_suffix("/*") {
            // keep the slash: "/p/*" must not match "/pother"
            PathPattern::Prefix(format!("{stripped}/"))
        } else if let Some(stripped) = pattern.strip_prefix('*') {
            PathPattern::Suffix(stripped.to_string())
        } else {
            PathPattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(exact) => path == exact,
            PathPattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathPattern::Suffix(suffix) => path.ends_with(suffix.as_str()),
        }
    }

    /// Removes the matched prefix from `path`, always leaving an absolute path.
    ///
    /// Exact patterns consume the whole path; suffix patterns leave it untouched.
    pub fn strip<'a>(&self, path: &'a str) -> Cow<'a, str> {
        match self {
            PathPattern::Exact(exact) if path == exact => Cow::Borrowed("/"),
            PathPattern::Prefix(prefix) => {
                let prefix = prefix.trim_end_matches('/');
                match path.strip_prefix(prefix) {
                    Some("") => Cow::Borrowed("/"),
                    Some(rest) if rest.starts_with('/') => Cow::Borrowed(rest),
                    Some(rest) => Cow::Owned(format!("/{rest}")),
                    None => Cow::Borrowed(path),
                }
            }
            _ => Cow::Borrowed(path),
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPattern::Exact(exact) => write!(f, "{exact}"),
            PathPattern::Prefix(prefix) => write!(f, "{prefix}*"),
            PathPattern::Suffix(suffix) => write!(f, "*{suffix}"),
        }
    }
}

/// Matches one request path against one `pathPattern` string.
pub fn matches(path: &str, pattern: &str) -> bool {
    PathPattern::parse(pattern).matches(path)
}
