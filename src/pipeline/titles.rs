//! Localized title resolution.
//!
//! A title may be a reference to a localizable resource
//! (`resource:{identifier}`). References are resolved eagerly to a
//! concrete string for storage, while the reference itself is retained so
//! titles can be re-resolved after a locale change. Resolution failure
//! falls back to the literal reference text without failing the insert.

use anyhow::Result;
use tracing::debug;

pub const RESOURCE_PREFIX: &str = "resource:";

/// External lookup: given a resource identifier and locale, return a
/// localized string or fail. Backed by the OS resource bundles; not
/// implemented here.
pub trait TitleResolver: Send + Sync {
    fn resolve(&self, resource: &str, locale: &str) -> Result<String>;
}

/// A resolver with no bundles: every reference falls back to its literal
/// text. Useful default and test double.
pub struct NoOpTitleResolver;

impl TitleResolver for NoOpTitleResolver {
    fn resolve(&self, resource: &str, _locale: &str) -> Result<String> {
        anyhow::bail!("no resource bundle for '{}'", resource)
    }
}

/// Split a raw title into (stored title, retained resource reference).
/// Plain titles pass through with no reference.
pub fn resolve_title(
    resolver: &dyn TitleResolver,
    locale: &str,
    raw_title: &str,
) -> (String, Option<String>) {
    let Some(resource) = raw_title.strip_prefix(RESOURCE_PREFIX) else {
        return (raw_title.to_string(), None);
    };
    match resolver.resolve(resource, locale) {
        Ok(localized) => (localized, Some(raw_title.to_string())),
        Err(e) => {
            debug!("Title resource '{}' did not resolve: {:#}", resource, e);
            (raw_title.to_string(), Some(raw_title.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    pub(crate) struct MapResolver {
        pub entries: HashMap<(String, String), String>,
    }

    impl TitleResolver for MapResolver {
        fn resolve(&self, resource: &str, locale: &str) -> Result<String> {
            self.entries
                .get(&(resource.to_string(), locale.to_string()))
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("missing"))
        }
    }

    #[test]
    fn plain_title_passes_through() {
        let (title, reference) = resolve_title(&NoOpTitleResolver, "en-US", "Ringtone");
        assert_eq!(title, "Ringtone");
        assert_eq!(reference, None);
    }

    #[test]
    fn reference_resolves_and_is_retained() {
        let mut entries = HashMap::new();
        entries.insert(
            ("ringtone_classic".to_string(), "de-DE".to_string()),
            "Klassischer Klingelton".to_string(),
        );
        let resolver = MapResolver { entries };
        let (title, reference) =
            resolve_title(&resolver, "de-DE", "resource:ringtone_classic");
        assert_eq!(title, "Klassischer Klingelton");
        assert_eq!(reference.as_deref(), Some("resource:ringtone_classic"));
    }

    #[test]
    fn failed_resolution_falls_back_to_literal() {
        let (title, reference) =
            resolve_title(&NoOpTitleResolver, "en-US", "resource:missing_entry");
        assert_eq!(title, "resource:missing_entry");
        assert_eq!(reference.as_deref(), Some("resource:missing_entry"));
    }
}
