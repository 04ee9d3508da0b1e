//! Static resource metadata.
//!
//! A [`ResourceSchema`] tells the differ which attribute changes a provider
//! can apply in place and which force a replacement. Attributes declared in
//! neither set are treated as replace-only.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::SchemaConfig;

/// How a changed attribute can be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    /// The provider can change it on the existing object.
    Updatable,
    /// The object must be destroyed and recreated.
    ReplaceOnly,
}

/// Schema of a single resource kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// Attributes whose change forces replacement.
    pub replace_only: BTreeSet<String>,
    /// Attributes the provider can change in place.
    pub updatable: BTreeSet<String>,
    /// Attributes computed by the provider.
    pub outputs: BTreeSet<String>,
}

impl ResourceSchema {
    /// Creates a schema from attribute name lists.
    #[must_use]
    pub fn new(replace_only: &[&str], updatable: &[&str], outputs: &[&str]) -> Self {
        let set = |names: &[&str]| names.iter().map(|n| (*n).to_string()).collect();
        Self {
            replace_only: set(replace_only),
            updatable: set(updatable),
            outputs: set(outputs),
        }
    }

    /// Classifies a changed attribute.
    #[must_use]
    pub fn classify(&self, attribute: &str) -> FieldClass {
        if self.updatable.contains(attribute) && !self.replace_only.contains(attribute) {
            FieldClass::Updatable
        } else {
            FieldClass::ReplaceOnly
        }
    }
}

impl From<&SchemaConfig> for ResourceSchema {
    fn from(config: &SchemaConfig) -> Self {
        Self {
            replace_only: config.replace_only.iter().cloned().collect(),
            updatable: config.updatable.iter().cloned().collect(),
            outputs: config.outputs.iter().cloned().collect(),
        }
    }
}

type SchemaRow = (
    &'static str,
    &'static [&'static str],
    &'static [&'static str],
    &'static [&'static str],
);

/// (kind, replace-only, updatable, outputs)
const BUILTIN: &[SchemaRow] = &[
    (
        "aws_vpc",
        &["cidr_block", "instance_tenancy"],
        &["tags", "enable_dns_support", "enable_dns_hostnames"],
        &["arn", "default_route_table_id", "main_route_table_id"],
    ),
    (
        "aws_subnet",
        &["vpc_id", "cidr_block", "availability_zone"],
        &["tags", "map_public_ip_on_launch"],
        &["arn"],
    ),
    (
        "aws_security_group",
        &["vpc_id", "name", "description"],
        &["tags", "ingress", "egress"],
        &["arn", "owner_id"],
    ),
    (
        "aws_network_interface",
        &["subnet_id"],
        &["tags", "private_ips", "security_groups", "description"],
        &["mac_address", "private_ip"],
    ),
    (
        "aws_internet_gateway",
        &[],
        &["tags", "vpc_id"],
        &["arn"],
    ),
    (
        "aws_route_table",
        &["vpc_id"],
        &["tags", "route"],
        &["arn"],
    ),
    (
        "aws_eip",
        &["domain"],
        &["tags", "instance", "network_interface", "associate_with_private_ip"],
        &["public_ip", "allocation_id"],
    ),
    (
        "aws_instance",
        &["ami", "availability_zone", "subnet_id", "key_name", "network_interface"],
        &["tags", "instance_type", "vpc_security_group_ids", "monitoring"],
        &["arn", "public_ip", "private_ip"],
    ),
    (
        "aws_db_subnet_group",
        &["name"],
        &["tags", "subnet_ids", "description"],
        &["arn"],
    ),
    (
        "aws_db_instance",
        &["engine", "identifier", "db_subnet_group_name", "availability_zone", "username"],
        &[
            "tags",
            "instance_class",
            "allocated_storage",
            "engine_version",
            "password",
            "backup_retention_period",
            "skip_final_snapshot",
            "vpc_security_group_ids",
            "multi_az",
        ],
        &["arn", "endpoint", "address", "port"],
    ),
];

/// Resource schemas by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaCatalog {
    schemas: BTreeMap<String, ResourceSchema>,
}

impl SchemaCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog of the built-in AWS kinds.
    #[must_use]
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for (kind, replace_only, updatable, outputs) in BUILTIN {
            catalog.insert(kind, ResourceSchema::new(replace_only, updatable, outputs));
        }
        catalog
    }

    /// Adds or replaces the schema of a kind.
    pub fn insert(&mut self, kind: &str, schema: ResourceSchema) {
        self.schemas.insert(kind.to_string(), schema);
    }

    /// Returns a copy extended with description-level schema overrides.
    #[must_use]
    pub fn merged(mut self, overrides: &[SchemaConfig]) -> Self {
        for config in overrides {
            self.insert(&config.kind, ResourceSchema::from(config));
        }
        self
    }

    /// Gets the schema of a kind.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&ResourceSchema> {
        self.schemas.get(kind)
    }

    /// Returns true if the kind is known.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.schemas.contains_key(kind)
    }

    /// Iterates over the known kinds in order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Classifies a changed attribute of a kind.
    ///
    /// Unknown kinds have no in-place updatable attributes.
    #[must_use]
    pub fn classify(&self, kind: &str, attribute: &str) -> FieldClass {
        self.get(kind)
            .map_or(FieldClass::ReplaceOnly, |schema| schema.classify(attribute))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_covers_tutorial_kinds() {
        let catalog = SchemaCatalog::builtin();
        for kind in [
            "aws_vpc",
            "aws_subnet",
            "aws_security_group",
            "aws_network_interface",
            "aws_internet_gateway",
            "aws_route_table",
            "aws_eip",
            "aws_instance",
            "aws_db_subnet_group",
            "aws_db_instance",
        ] {
            assert!(catalog.contains(kind), "missing {kind}");
        }
        assert_eq!(catalog.kinds().count(), 10);
    }

    #[test]
    fn test_classification() {
        let catalog = SchemaCatalog::builtin();
        assert_eq!(catalog.classify("aws_subnet", "tags"), FieldClass::Updatable);
        assert_eq!(
            catalog.classify("aws_subnet", "availability_zone"),
            FieldClass::ReplaceOnly
        );
        assert_eq!(catalog.classify("aws_subnet", "undeclared"), FieldClass::ReplaceOnly);
        assert_eq!(catalog.classify("nope", "tags"), FieldClass::ReplaceOnly);
    }

    #[test]
    fn test_merge_overrides_and_extends() {
        let overrides = vec![
            SchemaConfig {
                kind: String::from("custom_bucket"),
                replace_only: vec![String::from("region")],
                updatable: vec![String::from("tags")],
                outputs: vec![String::from("arn")],
            },
            SchemaConfig {
                kind: String::from("aws_vpc"),
                replace_only: vec![],
                updatable: vec![String::from("cidr_block")],
                outputs: vec![],
            },
        ];

        let catalog = SchemaCatalog::builtin().merged(&overrides);
        assert_eq!(catalog.classify("custom_bucket", "tags"), FieldClass::Updatable);
        assert_eq!(catalog.classify("aws_vpc", "cidr_block"), FieldClass::Updatable);
        assert_eq!(catalog.classify("aws_vpc", "tags"), FieldClass::ReplaceOnly);
    }
}
