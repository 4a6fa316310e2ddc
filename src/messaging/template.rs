use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{(\w+)\}").expect("placeholder pattern is valid"))
}

/// Replaces `{name}` placeholders with values from `variables`.
///
/// Placeholders without a matching variable are left as written so a
/// half-filled message is visible to the reader rather than silently blank.
pub fn render_template(template: &str, variables: &HashMap<String, String>) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| match variables.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}
