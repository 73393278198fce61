//! URL normalization rules.
//!
//! Rules are evaluated in order and the first enabled rule whose pattern
//! matches rewrites the url. Replacement templates use the `$1` / `$&` / `$$`
//! placeholder style that rule authors already know from browser regexes;
//! they are translated to the `regex` crate's syntax when a rule is compiled.

use crate::errors::{AppError, AppResult};
use crate::models::{GeneratedPattern, NormalizationRule, RuleIssue};
use regex::Regex;
use std::collections::HashSet;

const MAX_NORMALIZE_PASSES: usize = 8;

#[derive(Debug, Clone)]
struct CompiledRule {
    id: String,
    regex: Regex,
    template: String,
}

/// The enabled rules of a rule list, compiled once for repeated use.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compiles the enabled rules. Rules whose pattern does not compile are
    /// left out and reported instead of failing the whole set.
    pub fn compile(rules: &[NormalizationRule]) -> (Self, Vec<RuleIssue>) {
        let mut compiled = Vec::new();
        let mut issues = Vec::new();
        for rule in rules.iter().filter(|rule| rule.enabled) {
            match validate_pattern(&rule.pattern) {
                Ok(regex) => compiled.push(CompiledRule {
                    id: rule.id.clone(),
                    regex,
                    template: translate_template(&rule.replacement),
                }),
                Err(error) => {
                    tracing::warn!(rule_id = %rule.id, rule = %rule.name, error = %error, "skipping normalization rule");
                    issues.push(RuleIssue {
                        rule_id: rule.id.clone(),
                        rule_name: rule.name.clone(),
                        message: error.to_string(),
                    });
                }
            }
        }
        (Self { rules: compiled }, issues)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn normalize(&self, url: &str) -> String {
        for rule in &self.rules {
            if rule.regex.is_match(url) {
                tracing::trace!(rule_id = %rule.id, url, "normalization rule matched");
                return rule.regex.replace(url, rule.template.as_str()).into_owned();
            }
        }
        url.to_string()
    }

    /// Applies the rules until the url stops changing. Returns `None` when the
    /// rules cycle or do not settle within a few passes.
    pub fn normalize_to_fixpoint(&self, url: &str) -> Option<String> {
        let mut current = url.to_string();
        let mut seen = HashSet::new();
        seen.insert(current.clone());
        for _ in 0..MAX_NORMALIZE_PASSES {
            let next = self.normalize(&current);
            if next == current {
                return Some(current);
            }
            if !seen.insert(next.clone()) {
                return None;
            }
            current = next;
        }
        None
    }
}

/// Applies the first matching enabled rule to `url`, or returns it unchanged.
pub fn apply_url_normalization(url: &str, rules: &[NormalizationRule]) -> String {
    let (rule_set, _) = RuleSet::compile(rules);
    rule_set.normalize(url)
}

/// Reports every rule, enabled or not, whose pattern does not compile.
pub fn validate_rules(rules: &[NormalizationRule]) -> Vec<RuleIssue> {
    rules
        .iter()
        .filter_map(|rule| {
            validate_pattern(&rule.pattern).err().map(|error| RuleIssue {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                message: error.to_string(),
            })
        })
        .collect()
}

pub fn validate_pattern(pattern: &str) -> AppResult<Regex> {
    if pattern.is_empty() {
        return Err(AppError::InvalidPattern("pattern must not be empty".to_string()));
    }
    Regex::new(pattern).map_err(|error| AppError::InvalidPattern(error.to_string()))
}

/// Translates a `$1`-style template into `regex` replacement syntax.
///
/// `$n` / `$nn` become `${n}`, `$&` becomes the whole match and `$$` a literal
/// dollar. Any other `$` is kept literally.
pub fn translate_template(template: &str) -> String {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len() + 4);
    let mut index = 0;
    while index < chars.len() {
        let current = chars[index];
        if current != '$' {
            out.push(current);
            index += 1;
            continue;
        }
        match chars.get(index + 1) {
            Some('$') => {
                out.push_str("$$");
                index += 2;
            }
            Some('&') => {
                out.push_str("${0}");
                index += 2;
            }
            Some(digit) if digit.is_ascii_digit() => {
                let mut end = index + 1;
                while end < chars.len() && end < index + 3 && chars[end].is_ascii_digit() {
                    end += 1;
                }
                let digits: String = chars[index + 1..end].iter().collect();
                if digits.parse::<u32>().unwrap_or(0) == 0 {
                    out.push_str("$$");
                    out.push_str(&digits);
                } else {
                    out.push_str("${");
                    out.push_str(&digits);
                    out.push('}');
                }
                index = end;
            }
            _ => {
                out.push_str("$$");
                index += 1;
            }
        }
    }
    out
}

/// Builds a rule from sample urls that differ in one segment.
///
/// The samples' longest common prefix and suffix are kept literally. When every
/// sample's middle is all digits it is matched with `\d+` and dropped from the
/// replacement; otherwise it is captured with `([^/]+)` and carried over as `$1`.
pub fn generate_regex_from_urls(urls: &[String]) -> AppResult<GeneratedPattern> {
    let mut samples: Vec<Vec<char>> = Vec::new();
    for url in urls {
        let url = url.trim();
        if url.is_empty() {
            continue;
        }
        let chars: Vec<char> = url.chars().collect();
        if !samples.contains(&chars) {
            samples.push(chars);
        }
    }
    if samples.len() < 2 {
        return Err(AppError::InvalidInput(
            "at least two distinct sample urls are required".to_string(),
        ));
    }

    let min_len = samples.iter().map(Vec::len).min().unwrap_or(0);
    let prefix_len = (0..min_len)
        .take_while(|&i| samples.iter().all(|sample| sample[i] == samples[0][i]))
        .count();
    let suffix_len = (0..min_len - prefix_len)
        .take_while(|&i| {
            let first = &samples[0];
            samples
                .iter()
                .all(|sample| sample[sample.len() - 1 - i] == first[first.len() - 1 - i])
        })
        .count();

    // Digits on the boundary belong to the variable segment.
    let mut numeric_prefix = prefix_len;
    while numeric_prefix > 0 && samples[0][numeric_prefix - 1].is_ascii_digit() {
        numeric_prefix -= 1;
    }
    let mut numeric_suffix = suffix_len;
    while numeric_suffix > 0 && samples[0][samples[0].len() - numeric_suffix].is_ascii_digit() {
        numeric_suffix -= 1;
    }
    let numeric = samples.iter().all(|sample| {
        let middle = &sample[numeric_prefix..sample.len() - numeric_suffix];
        !middle.is_empty() && middle.iter().all(char::is_ascii_digit)
    });

    let (prefix_len, suffix_len) = if numeric {
        (numeric_prefix, numeric_suffix)
    } else {
        (prefix_len, suffix_len)
    };
    let first = &samples[0];
    let prefix: String = first[..prefix_len].iter().collect();
    let suffix: String = first[first.len() - suffix_len..].iter().collect();
    let all_middles_present = samples
        .iter()
        .all(|sample| sample.len() > prefix_len + suffix_len);
    // A captured segment never spans path separators.
    if !numeric
        && samples
            .iter()
            .any(|sample| sample[prefix_len..sample.len() - suffix_len].contains(&'/'))
    {
        return Err(AppError::InvalidInput(
            "sample urls differ across more than one path segment".to_string(),
        ));
    }

    let (segment, replacement) = if numeric {
        (r"\d+", format!("{}{}", escape_template(&prefix), escape_template(&suffix)))
    } else if all_middles_present {
        (
            "([^/]+)",
            format!("{}$1{}", escape_template(&prefix), escape_template(&suffix)),
        )
    } else {
        (
            "([^/]*)",
            format!("{}$1{}", escape_template(&prefix), escape_template(&suffix)),
        )
    };
    let pattern = format!("^{}{}{}$", regex::escape(&prefix), segment, regex::escape(&suffix));
    validate_pattern(&pattern)?;

    Ok(GeneratedPattern {
        pattern,
        replacement,
        numeric_segment: numeric,
    })
}

fn escape_template(literal: &str) -> String {
    literal.replace('$', "$$")
}
