//! Typed ID definitions for schedulable work and the resources it touches.
//!
//! Each ID type has a unique prefix that identifies the resource type.

use crate::define_id;
use crate::IdError;

// =============================================================================
// Work items
// =============================================================================

define_id!(WorkItemId, "item");

// =============================================================================
// Resources referenced by work items
// =============================================================================

define_id!(ProjectId, "prj");
define_id!(InventoryId, "inv");
define_id!(InventorySourceId, "invsrc");
define_id!(TemplateId, "tpl");
define_id!(WorkflowTemplateId, "wft");

// =============================================================================
// Workflow graphs
// =============================================================================

define_id!(WorkflowNodeId, "wfn");

// =============================================================================
// Nodes
// =============================================================================

/// Maximum length of a DNS hostname.
const MAX_HOSTNAME_LEN: usize = 253;

/// Node identity.
///
/// Nodes are keyed by hostname; ordering is lexicographic so it can serve as
/// a deterministic tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hostname(String);

impl Hostname {
    /// Validates and wraps a hostname.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > MAX_HOSTNAME_LEN {
            return Err(IdError::InvalidHostname {
                message: format!("longer than {MAX_HOSTNAME_LEN} characters"),
            });
        }
        if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(IdError::InvalidHostname {
                message: format!("'{s}' contains whitespace or control characters"),
            });
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the hostname as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Hostname {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Hostname {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Hostname {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for Hostname {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Hostname {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_project_id_display() {
        assert_eq!(ProjectId::new(7).to_string(), "prj_7");
    }

    #[test]
    fn test_work_item_id_parse() {
        let parsed: WorkItemId = "item_1042".parse().unwrap();
        assert_eq!(parsed.value(), 1042);
    }

    #[test]
    fn test_inventory_source_prefix_contains_no_confusion() {
        // "invsrc_3" must not parse as an InventoryId.
        let result: Result<InventoryId, _> = "invsrc_3".parse();
        assert!(matches!(
            result.unwrap_err(),
            IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_id_missing_separator() {
        let result: Result<ProjectId, _> = "prj7".parse();
        assert!(matches!(result.unwrap_err(), IdError::MissingSeparator));
    }

    #[test]
    fn test_id_empty() {
        let result: Result<TemplateId, _> = "".parse();
        assert!(result.unwrap_err().is_empty());
    }

    #[test]
    fn test_id_rejects_non_positive() {
        assert!(matches!(
            "tpl_0".parse::<TemplateId>().unwrap_err(),
            IdError::InvalidNumber(_)
        ));
        assert!(matches!(
            "tpl_-4".parse::<TemplateId>().unwrap_err(),
            IdError::InvalidNumber(_)
        ));
    }

    #[test]
    fn test_id_json_form() {
        let id = WorkflowTemplateId::new(12);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"wft_12\"");
        let parsed: WorkflowTemplateId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_hostname_validation() {
        assert!(Hostname::parse("awx-1.example.com").is_ok());
        assert!(Hostname::parse("").unwrap_err().is_empty());
        assert!(matches!(
            Hostname::parse("bad host").unwrap_err(),
            IdError::InvalidHostname { .. }
        ));
        assert!(Hostname::parse(&"a".repeat(254)).is_err());
    }

    #[test]
    fn test_hostname_orders_lexicographically() {
        let a = Hostname::parse("node-a").unwrap();
        let b = Hostname::parse("node-b").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = vec![
            WorkItemId::PREFIX,
            ProjectId::PREFIX,
            InventoryId::PREFIX,
            InventorySourceId::PREFIX,
            TemplateId::PREFIX,
            WorkflowTemplateId::PREFIX,
            WorkflowNodeId::PREFIX,
        ];

        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest! {
        #[test]
        fn prop_work_item_id_text_form_parses_back(n in 1i64..i64::MAX) {
            let id = WorkItemId::new(n);
            let parsed: WorkItemId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }
    }
}
