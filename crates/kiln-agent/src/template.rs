use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;

use crate::error::ControlError;
use crate::support::InstallPaths;

pub const SERVICE_TEMPLATE: &str = "service.template";
pub const STARTUP_TEMPLATE: &str = "startup.template";
pub const DOCKERFILE_TEMPLATE: &str = "dockerfile.template";

/// Substitute `{{ident}}` placeholders in a single linear scan.
///
/// Identifiers missing from `values` are left as literal placeholders.
/// Substituted values are emitted verbatim and never rescanned, so output
/// is independent of map iteration order and a value can never be
/// mistaken for a later token.
pub fn render(template: &str, values: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let ident = &after_open[..close];
                match values.get(ident) {
                    Some(v) => out.push_str(v),
                    None => {
                        out.push_str("{{");
                        out.push_str(ident);
                        out.push_str("}}");
                    }
                }
                rest = &after_open[close + 2..];
            }
            None => {
                // Unterminated opener: keep the remainder literally.
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn bundled(name: &str) -> Option<&'static str> {
    match name {
        SERVICE_TEMPLATE => Some(include_str!("../resources/service.template")),
        STARTUP_TEMPLATE => Some(include_str!("../resources/startup.template")),
        DOCKERFILE_TEMPLATE => Some(include_str!("../resources/dockerfile.template")),
        _ => None,
    }
}

pub fn cached_template_path(paths: &InstallPaths, name: &str) -> PathBuf {
    paths.templates_dir().join(name)
}

/// Resolve a template source: prefer the per-install mutable cache, and on
/// a cache miss copy the bundled read-only resource there first. Users can
/// edit the cached copy; we never overwrite it.
pub async fn load_template(paths: &InstallPaths, name: &str) -> anyhow::Result<String> {
    let cached = cached_template_path(paths, name);
    if let Ok(content) = tokio::fs::read_to_string(&cached).await {
        return Ok(content);
    }

    let content = bundled(name).ok_or_else(|| ControlError::TemplateMissing(name.to_string()))?;
    let cache_dir = paths.templates_dir();
    tokio::fs::create_dir_all(&cache_dir)
        .await
        .with_context(|| format!("create template cache {}", cache_dir.display()))?;
    tokio::fs::write(&cached, content)
        .await
        .with_context(|| format!("cache template {}", cached.display()))?;
    Ok(content.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn render_replaces_every_occurrence() {
        let out = render(
            "{{name}}: {{name}} on {{port}}",
            &values(&[("name", "demo"), ("port", "9001")]),
        );
        assert_eq!(out, "demo: demo on 9001");
    }

    #[test]
    fn render_leaves_unknown_placeholders_literal() {
        let out = render("hello {{missing}}", &values(&[("name", "demo")]));
        assert_eq!(out, "hello {{missing}}");
    }

    #[test]
    fn render_never_rescans_substituted_values() {
        // A value that looks like another token must not be expanded.
        let out = render(
            "{{a}} {{b}}",
            &values(&[("a", "{{b}}"), ("b", "two")]),
        );
        assert_eq!(out, "{{b}} two");
    }

    #[test]
    fn render_is_order_independent() {
        let template = "{{x}}-{{y}}-{{z}}";
        let a = values(&[("x", "1"), ("y", "2"), ("z", "3")]);
        let b = values(&[("z", "3"), ("x", "1"), ("y", "2")]);
        assert_eq!(render(template, &a), render(template, &b));
    }

    #[test]
    fn render_keeps_unterminated_opener() {
        let out = render("broken {{tail", &values(&[("tail", "x")]));
        assert_eq!(out, "broken {{tail");
    }

    #[tokio::test]
    async fn load_template_seeds_cache_then_prefers_it() {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstallPaths::new(dir.path().to_path_buf());

        let first = load_template(&paths, SERVICE_TEMPLATE).await.unwrap();
        let cached = cached_template_path(&paths, SERVICE_TEMPLATE);
        assert_eq!(tokio::fs::read_to_string(&cached).await.unwrap(), first);

        // A user-edited cache copy wins over the bundled resource.
        tokio::fs::write(&cached, "  {{name}}:\n    image: custom\n")
            .await
            .unwrap();
        let second = load_template(&paths, SERVICE_TEMPLATE).await.unwrap();
        assert!(second.contains("image: custom"));
    }

    #[tokio::test]
    async fn load_template_rejects_unknown_names() {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstallPaths::new(dir.path().to_path_buf());
        let err = load_template(&paths, "nope.template").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn bundled_service_template_has_expected_placeholders() {
        let t = bundled(SERVICE_TEMPLATE).unwrap();
        for key in ["{{name}}", "{{port}}", "{{notebook_port}}", "{{shared_models_dir}}", "{{network_name}}"] {
            assert!(t.contains(key), "missing {key}");
        }
    }
}
