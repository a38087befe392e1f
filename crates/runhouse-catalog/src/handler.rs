//! Asset Handler Registry
//!
//! Resources name the handler spec needed to interpret their asset
//! ("AD_HDF5", "AD_TIFF", ...). A catalog carries a registry mapping each
//! spec to a dotted `module.ClassName` handler path, validated up front so
//! a bad registry fails at configuration time, not mid-stream. Actually
//! materializing asset values is a consumer concern; the catalog only
//! resolves which handler applies.

use std::collections::BTreeMap;
use std::fmt;

use runhouse_core::Resource;

use crate::error::{CatalogError, Result};

/// A parsed `module.ClassName` handler path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSpec {
    pub module: String,
    pub class: String,
}

impl fmt::Display for HandlerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.class)
    }
}

/// Spec name to handler path.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, HandlerSpec>,
}

impl HandlerRegistry {
    /// Parse a registry from `(spec, "module.ClassName")` pairs.
    pub fn parse(
        specs: impl IntoIterator<Item = (impl Into<String>, impl AsRef<str>)>,
    ) -> Result<Self> {
        let mut handlers = BTreeMap::new();
        for (spec, path) in specs {
            let spec = spec.into();
            let path = path.as_ref();
            let (module, class) = path.rsplit_once('.').ok_or_else(|| {
                CatalogError::Misconfigured(format!(
                    "handler for spec {spec:?} must be a dotted module path, got {path:?}"
                ))
            })?;
            if module.is_empty() || class.is_empty() {
                return Err(CatalogError::Misconfigured(format!(
                    "handler for spec {spec:?} must be a dotted module path, got {path:?}"
                )));
            }
            handlers.insert(
                spec,
                HandlerSpec {
                    module: module.to_string(),
                    class: class.to_string(),
                },
            );
        }
        Ok(Self { handlers })
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// The handler for a resource's spec.
    pub fn handler_for(&self, resource: &Resource) -> Result<&HandlerSpec> {
        self.handlers.get(&resource.spec).ok_or_else(|| {
            CatalogError::Misconfigured(format!(
                "no handler registered for resource spec {:?}",
                resource.spec
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(spec: &str) -> Resource {
        Resource {
            uid: "res-1".to_string(),
            run_start: "run-a".to_string(),
            spec: spec.to_string(),
            root: String::new(),
            resource_path: "x".to_string(),
            resource_kwargs: Default::default(),
            extra: Default::default(),
        }
    }

    #[test]
    fn parses_dotted_paths() {
        let registry = HandlerRegistry::parse([
            ("AD_HDF5", "area_detector.handlers.HDF5Handler"),
            ("AD_TIFF", "tiff_io.TiffStack"),
        ])
        .unwrap();
        assert_eq!(registry.len(), 2);
        let handler = registry.handler_for(&resource("AD_HDF5")).unwrap();
        assert_eq!(handler.module, "area_detector.handlers");
        assert_eq!(handler.class, "HDF5Handler");
        assert_eq!(handler.to_string(), "area_detector.handlers.HDF5Handler");
    }

    #[test]
    fn undotted_paths_are_misconfigured() {
        for bad in ["NoDots", ".Leading", "trailing."] {
            let err = HandlerRegistry::parse([("SPEC", bad)]).unwrap_err();
            assert!(matches!(err, CatalogError::Misconfigured(_)), "{bad}");
        }
    }

    #[test]
    fn unknown_spec_is_misconfigured() {
        let registry = HandlerRegistry::parse([("AD_HDF5", "a.B")]).unwrap();
        assert!(registry.handler_for(&resource("MYSTERY")).is_err());
        assert!(HandlerRegistry::default().is_empty());
    }
}
