use crate::model::{ProxyRule, ProxyRuleSet};

/// Returns the first enabled rule, in declared order, whose pattern matches `path`.
///
/// Resolution is first-match-wins: a broad rule placed before a more specific one
/// shadows it. Rule sets rely on this, so the walk must not look for a better match.
pub fn resolve<'a>(rule_set: &'a ProxyRuleSet, path: &str) -> Option<&'a ProxyRule> {
    rule_set
        .rules()
        .iter()
        .filter(|rule| rule.is_enabled)
        .find(|rule| rule.pattern.matches(path))
}
