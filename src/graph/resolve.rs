//! Reference resolution.
//!
//! Attribute expressions are resolved against an [`OutputSource`]. During
//! planning a referenced resource that is about to be created or replaced has
//! no outputs yet, so the value is [`ResolvedValue::Unknown`]; at apply time
//! every dependency has been committed and resolution must be complete.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::{AttrExpr, Attributes, Reference};
use crate::error::{ConvergeError, PlanError, Result};

use super::builder::ResourceNode;

/// Answer of an output source for one reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// The value is known.
    Known(Value),
    /// The target will only know the value after it is applied.
    Pending,
    /// The target has no such output.
    Missing(String),
}

/// Supplies output values of other resources.
pub trait OutputSource {
    /// Looks up the value a reference points at.
    fn lookup(&self, reference: &Reference) -> Lookup;
}

/// A resolved attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedValue {
    /// Fully known value.
    Known(Value),
    /// Known after apply.
    Unknown,
}

/// Resolved attributes of one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedAttributes {
    /// Per-attribute resolution.
    pub values: BTreeMap<String, ResolvedValue>,
}

enum Partial {
    Known(Value),
    Unknown,
}

impl ResolvedAttributes {
    /// Returns true if no attribute is unknown.
    #[must_use]
    pub fn is_fully_known(&self) -> bool {
        self.values
            .values()
            .all(|v| matches!(v, ResolvedValue::Known(_)))
    }

    /// Converts into plain attributes when fully known.
    #[must_use]
    pub fn into_known(self) -> Option<Attributes> {
        self.values
            .into_iter()
            .map(|(k, v)| match v {
                ResolvedValue::Known(value) => Some((k, value)),
                ResolvedValue::Unknown => None,
            })
            .collect()
    }
}

/// Resolves every attribute of a node against the given source.
///
/// # Errors
///
/// Returns `PlanError::ResolutionFailed` if a reference names a missing output.
pub fn resolve_node(node: &ResourceNode, source: &dyn OutputSource) -> Result<ResolvedAttributes> {
    let mut values = BTreeMap::new();
    for (name, expr) in &node.attributes {
        let resolved = match resolve_expr(expr, source).map_err(|(reference, message)| {
            ConvergeError::Plan(PlanError::ResolutionFailed {
                key: node.key.to_string(),
                reference,
                message,
            })
        })? {
            Partial::Known(value) => ResolvedValue::Known(value),
            Partial::Unknown => ResolvedValue::Unknown,
        };
        values.insert(name.clone(), resolved);
    }
    Ok(ResolvedAttributes { values })
}

fn resolve_expr(
    expr: &AttrExpr,
    source: &dyn OutputSource,
) -> std::result::Result<Partial, (String, String)> {
    match expr {
        AttrExpr::Literal(value) => Ok(Partial::Known(value.clone())),
        AttrExpr::Ref(r) => {
            let reference =
                Reference::parse(&r.target).map_err(|message| (r.target.clone(), message))?;
            match source.lookup(&reference) {
                Lookup::Known(value) => Ok(Partial::Known(value)),
                Lookup::Pending => Ok(Partial::Unknown),
                Lookup::Missing(message) => Err((reference.to_string(), message)),
            }
        }
        // Every element is resolved so a missing output surfaces even next
        // to a pending one.
        AttrExpr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            let mut unknown = false;
            for item in items {
                match resolve_expr(item, source)? {
                    Partial::Known(value) => out.push(value),
                    Partial::Unknown => unknown = true,
                }
            }
            Ok(if unknown {
                Partial::Unknown
            } else {
                Partial::Known(Value::Array(out))
            })
        }
        AttrExpr::Map(entries) => {
            let mut out = serde_json::Map::new();
            let mut unknown = false;
            for (k, v) in entries {
                match resolve_expr(v, source)? {
                    Partial::Known(value) => {
                        out.insert(k.clone(), value);
                    }
                    Partial::Unknown => unknown = true,
                }
            }
            Ok(if unknown {
                Partial::Unknown
            } else {
                Partial::Known(Value::Object(out))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LifecycleConfig, ResourceKey};
    use serde_json::json;

    struct Fixed;

    impl OutputSource for Fixed {
        fn lookup(&self, reference: &Reference) -> Lookup {
            match (reference.key.name.as_str(), reference.attribute.as_str()) {
                ("known", "id") => Lookup::Known(json!("vpc-123")),
                ("pending", _) => Lookup::Pending,
                _ => Lookup::Missing(format!("no output {}", reference.attribute)),
            }
        }
    }

    fn node(attributes: BTreeMap<String, AttrExpr>) -> ResourceNode {
        ResourceNode {
            key: ResourceKey::new("aws_subnet", "s"),
            attributes,
            references: Vec::new(),
            lifecycle: LifecycleConfig::default(),
        }
    }

    #[test]
    fn test_resolve_known_nested() {
        let mut attrs = BTreeMap::new();
        attrs.insert(String::from("vpc_id"), AttrExpr::reference("aws_vpc.known.id"));
        attrs.insert(
            String::from("ids"),
            AttrExpr::List(vec![AttrExpr::reference("aws_vpc.known"), AttrExpr::string("x")]),
        );

        let resolved = resolve_node(&node(attrs), &Fixed).expect("resolve");
        assert!(resolved.is_fully_known());
        let known = resolved.into_known().expect("known");
        assert_eq!(known["vpc_id"], json!("vpc-123"));
        assert_eq!(known["ids"], json!(["vpc-123", "x"]));
    }

    #[test]
    fn test_pending_reference_is_unknown() {
        let mut attrs = BTreeMap::new();
        attrs.insert(
            String::from("tags"),
            AttrExpr::Map(BTreeMap::from([(
                String::from("vpc"),
                AttrExpr::reference("aws_vpc.pending.id"),
            )])),
        );

        let resolved = resolve_node(&node(attrs), &Fixed).expect("resolve");
        assert_eq!(resolved.values["tags"], ResolvedValue::Unknown);
        assert!(resolved.into_known().is_none());
    }

    #[test]
    fn test_missing_output_fails() {
        let mut attrs = BTreeMap::new();
        attrs.insert(String::from("arn"), AttrExpr::reference("aws_vpc.known.arn"));
        assert!(resolve_node(&node(attrs), &Fixed).is_err());
    }

    #[test]
    fn test_missing_output_after_pending_element_fails() {
        let mut attrs = BTreeMap::new();
        attrs.insert(
            String::from("security_groups"),
            AttrExpr::List(vec![
                AttrExpr::reference("aws_security_group.pending.id"),
                AttrExpr::reference("aws_vpc.known.arn"),
            ]),
        );
        attrs.insert(
            String::from("tags"),
            AttrExpr::Map(BTreeMap::from([
                (String::from("a"), AttrExpr::reference("aws_vpc.pending.id")),
                (String::from("b"), AttrExpr::reference("aws_vpc.known.arn")),
            ])),
        );
        let err = resolve_node(&node(attrs), &Fixed).expect_err("missing output");
        assert!(err.to_string().contains("aws_vpc.known.arn"), "{err}");
    }
}
