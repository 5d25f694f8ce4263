//! Run and plan name templates with `%(attribute)` placeholders.

use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"%\((.*?)\)").unwrap());

/// Replace every `%(name)` in `template` with `lookup(name)`.
///
/// An unknown attribute is a configuration error. Known attributes without a
/// value render as an empty string.
pub fn render_name<F>(template: &str, lookup: F) -> Result<String, String>
where
    F: Fn(&str) -> Option<Option<String>>,
{
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for captures in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let value = lookup(name.as_str()).ok_or_else(|| {
            format!(
                "invalid test_run_name or test_plan_name configured: '{}' not known",
                name.as_str()
            )
        })?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(value.as_deref().unwrap_or_default());
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<Option<String>> {
        match name {
            "project_key" => Some(Some("PRJ".to_string())),
            "test_run_suffix" => Some(Some("nightly".to_string())),
            "test_plan_key" => Some(None),
            _ => None,
        }
    }

    #[test]
    fn renders_default_template() {
        let name = render_name("%(project_key) %(test_run_suffix)", lookup).expect("render");
        assert_eq!(name, "PRJ nightly");
    }

    #[test]
    fn missing_values_render_empty() {
        let name = render_name("plan=%(test_plan_key)!", lookup).expect("render");
        assert_eq!(name, "plan=!");
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        let err = render_name("%(nope) run", lookup).expect_err("unknown");
        assert!(err.contains("'nope' not known"));
    }

    #[test]
    fn plain_text_is_kept() {
        assert_eq!(render_name("fixed name", lookup).expect("render"), "fixed name");
    }
}
