// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Routing rules and the pluggable strategy contract.
//!
//! A [`RouteRule`] binds a source table to a target node group and names the
//! [`RouteStrategy`] that decides which candidate nodes receive each row.
//! Strategies are registered by tag in a [`StrategyRegistry`] and dispatched
//! per row; they are pure decision functions over row metadata plus the
//! per-pass [`PassCache`], and must not touch the change store.
//!
//! The return contract for [`RouteStrategy::route_to_nodes`]:
//!
//! - `Ok(Some(nodes))`: route the row to exactly these nodes (a subset of
//!   the candidates; anything else is discarded by the caller).
//! - `Ok(None)`: this rule abstains. Other rules on the table may still
//!   claim the row; the row is unrouted only if every rule abstains.
//! - `Err(_)`: fail the channel pass. Nothing from the pass commits.

use crate::context::PassCache;
use crate::error::{Result, RouterError};
use crate::model::{parse_csv_values, ChangeRow, EventKind};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Column layout of a captured table, used to address CSV payloads by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub table_name: String,
    pub column_names: Vec<String>,
    pub pk_column_names: Vec<String>,
}

impl TableDef {
    pub fn new(
        table_name: impl Into<String>,
        column_names: Vec<String>,
        pk_column_names: Vec<String>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            column_names,
            pk_column_names,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }
}

/// One routing rule: source table, target group, strategy tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    /// Unique id, stamped on every data event this rule produces.
    pub router_id: String,
    /// Tag of the registered strategy this rule dispatches to.
    pub strategy: String,
    pub source_table: String,
    /// Node group whose members are the candidate set.
    pub target_group_id: String,
    /// Allow routing a change back to the node it came from.
    pub ping_back_enabled: bool,
    pub route_inserts: bool,
    pub route_updates: bool,
    pub route_deletes: bool,
}

impl RouteRule {
    /// A rule with the common defaults: routes every event kind, no
    /// ping-back.
    pub fn new(
        router_id: impl Into<String>,
        strategy: impl Into<String>,
        source_table: impl Into<String>,
        target_group_id: impl Into<String>,
    ) -> Self {
        Self {
            router_id: router_id.into(),
            strategy: strategy.into(),
            source_table: source_table.into(),
            target_group_id: target_group_id.into(),
            ping_back_enabled: false,
            route_inserts: true,
            route_updates: true,
            route_deletes: true,
        }
    }

    /// Whether this rule applies to the given event kind. Reload and SQL
    /// events always route.
    pub fn applies_to(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Insert => self.route_inserts,
            EventKind::Update => self.route_updates,
            EventKind::Delete => self.route_deletes,
            EventKind::Reload | EventKind::Sql => true,
        }
    }
}

/// Where rules, group membership and table layouts come from.
///
/// The engine resolves all three per row; implementations should answer from
/// memory (the default [`StaticRuleSource`] does).
pub trait RuleSource: Send + Sync {
    /// Rules for a table, in evaluation order. An empty result means the
    /// table is not replicated.
    fn rules_for_table(&self, table_name: &str) -> Vec<RouteRule>;

    /// Node ids belonging to a target group.
    fn nodes_in_group(&self, group_id: &str) -> Vec<String>;

    /// Column layout for a table, if known.
    fn table_def(&self, table_name: &str) -> Option<TableDef>;
}

/// In-memory rule source, configured up front.
#[derive(Debug, Default)]
pub struct StaticRuleSource {
    rules_by_table: HashMap<String, Vec<RouteRule>>,
    groups: HashMap<String, Vec<String>>,
    tables: HashMap<String, TableDef>,
}

impl StaticRuleSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(mut self, rule: RouteRule) -> Self {
        self.rules_by_table
            .entry(rule.source_table.to_lowercase())
            .or_default()
            .push(rule);
        self
    }

    pub fn add_group(mut self, group_id: &str, node_ids: &[&str]) -> Self {
        self.groups.insert(
            group_id.to_string(),
            node_ids.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    pub fn add_table(mut self, def: TableDef) -> Self {
        self.tables.insert(def.table_name.to_lowercase(), def);
        self
    }
}

impl RuleSource for StaticRuleSource {
    fn rules_for_table(&self, table_name: &str) -> Vec<RouteRule> {
        self.rules_by_table
            .get(&table_name.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    fn nodes_in_group(&self, group_id: &str) -> Vec<String> {
        self.groups.get(group_id).cloned().unwrap_or_default()
    }

    fn table_def(&self, table_name: &str) -> Option<TableDef> {
        self.tables.get(&table_name.to_lowercase()).cloned()
    }
}

/// A change row decoded for strategy consumption.
///
/// Payloads are parsed lazily-ish: the constructor parses once, and column
/// addressing goes through the table layout when one is known.
#[derive(Debug)]
pub struct RowMetadata {
    pub data_id: i64,
    pub table_name: String,
    pub event_kind: EventKind,
    pub transaction_id: Option<String>,
    pub source_node_id: Option<String>,
    new_values: Vec<Option<String>>,
    old_values: Vec<Option<String>>,
    pk_values: Vec<Option<String>>,
    table: Option<TableDef>,
}

impl RowMetadata {
    pub fn decode(row: &ChangeRow, table: Option<TableDef>) -> Self {
        Self {
            data_id: row.data_id,
            table_name: row.table_name.clone(),
            event_kind: row.event_kind,
            transaction_id: row.transaction_id.clone(),
            source_node_id: row.source_node_id.clone(),
            new_values: row.row_data.as_deref().map(parse_csv_values).unwrap_or_default(),
            old_values: row.old_data.as_deref().map(parse_csv_values).unwrap_or_default(),
            pk_values: row.pk_data.as_deref().map(parse_csv_values).unwrap_or_default(),
            table,
        }
    }

    pub fn new_values(&self) -> &[Option<String>] {
        &self.new_values
    }

    pub fn old_values(&self) -> &[Option<String>] {
        &self.old_values
    }

    pub fn pk_values(&self) -> &[Option<String>] {
        &self.pk_values
    }

    /// Look up a column value by name: new values for inserts/updates, old
    /// values for deletes. `None` when the table layout is unknown, the
    /// column does not exist, or the value is NULL.
    pub fn column_value(&self, column: &str) -> Option<&str> {
        let idx = self.table.as_ref()?.column_index(column)?;
        let values = match self.event_kind {
            EventKind::Delete => &self.old_values,
            _ => &self.new_values,
        };
        values.get(idx)?.as_deref()
    }
}

/// Per-row routing decision plus batch lifecycle hooks.
pub trait RouteStrategy: Send + Sync {
    /// Decide which candidate nodes receive the row. See the module docs
    /// for the return contract.
    fn route_to_nodes(
        &self,
        cache: &mut PassCache,
        row: &RowMetadata,
        candidates: &HashSet<String>,
        initial_load: bool,
    ) -> Result<Option<HashSet<String>>>;

    /// Called inside the pass transaction as each batch completes.
    fn on_batch_complete(&self, _batch_id: i64, _node_id: &str) -> Result<()> {
        Ok(())
    }

    /// Called after the pass transaction commits, once per used strategy.
    fn on_context_committed(&self, _cache: &mut PassCache) -> Result<()> {
        Ok(())
    }
}

/// Routes each row to every candidate node.
pub struct DefaultStrategy;

impl RouteStrategy for DefaultStrategy {
    fn route_to_nodes(
        &self,
        _cache: &mut PassCache,
        _row: &RowMetadata,
        candidates: &HashSet<String>,
        _initial_load: bool,
    ) -> Result<Option<HashSet<String>>> {
        Ok(Some(candidates.clone()))
    }
}

/// Routes to candidates whose node id equals a configured column's value.
///
/// The conventional way to partition rows by store/tenant: the capture
/// carries the owning node id in a column, and only that node gets the row.
pub struct ColumnMatchStrategy {
    pub column: String,
}

impl RouteStrategy for ColumnMatchStrategy {
    fn route_to_nodes(
        &self,
        _cache: &mut PassCache,
        row: &RowMetadata,
        candidates: &HashSet<String>,
        _initial_load: bool,
    ) -> Result<Option<HashSet<String>>> {
        match row.column_value(&self.column) {
            Some(value) => {
                let matched: HashSet<String> = candidates
                    .iter()
                    .filter(|node| node.as_str() == value)
                    .cloned()
                    .collect();
                Ok(Some(matched))
            }
            // Column missing entirely: abstain rather than claim the row.
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for dyn RouteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RouteStrategy")
    }
}

/// Registry mapping strategy tags to implementations.
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn RouteStrategy>>,
}

impl StrategyRegistry {
    /// Registry with the built-in "default" strategy installed.
    pub fn new() -> Self {
        let mut registry = Self {
            strategies: HashMap::new(),
        };
        registry.register("default", Arc::new(DefaultStrategy));
        registry
    }

    pub fn register(&mut self, tag: &str, strategy: Arc<dyn RouteStrategy>) {
        self.strategies.insert(tag.to_string(), strategy);
    }

    /// Resolve a rule's strategy tag, failing the pass on an unknown tag.
    pub fn resolve(&self, router_id: &str, tag: &str) -> Result<Arc<dyn RouteStrategy>> {
        self.strategies.get(tag).cloned().ok_or_else(|| {
            RouterError::Strategy {
                router_id: router_id.to_string(),
                message: format!("unknown strategy tag '{tag}'"),
            }
        })
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.strategies.contains_key(tag)
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn change(table: &str, kind: EventKind, row_data: Option<&str>, old: Option<&str>) -> ChangeRow {
        ChangeRow {
            data_id: 1,
            table_name: table.to_string(),
            event_kind: kind,
            row_data: row_data.map(String::from),
            old_data: old.map(String::from),
            pk_data: Some("1".to_string()),
            transaction_id: None,
            channel_id: "default".to_string(),
            source_node_id: None,
            create_time: Utc::now(),
        }
    }

    fn item_table() -> TableDef {
        TableDef::new(
            "item",
            vec!["id".to_string(), "store_id".to_string(), "name".to_string()],
            vec!["id".to_string()],
        )
    }

    fn candidates(nodes: &[&str]) -> HashSet<String> {
        nodes.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_strategy_routes_to_all_candidates() {
        let strategy = DefaultStrategy;
        let row = RowMetadata::decode(
            &change("item", EventKind::Insert, Some("1,store-1,widget"), None),
            Some(item_table()),
        );
        let mut cache = PassCache::new();
        let result = strategy
            .route_to_nodes(&mut cache, &row, &candidates(&["a", "b"]), false)
            .unwrap();
        assert_eq!(result, Some(candidates(&["a", "b"])));
    }

    #[test]
    fn test_column_match_strategy() {
        let strategy = ColumnMatchStrategy {
            column: "store_id".to_string(),
        };
        let row = RowMetadata::decode(
            &change("item", EventKind::Insert, Some("1,store-1,widget"), None),
            Some(item_table()),
        );
        let mut cache = PassCache::new();
        let result = strategy
            .route_to_nodes(&mut cache, &row, &candidates(&["store-1", "store-2"]), false)
            .unwrap();
        assert_eq!(result, Some(candidates(&["store-1"])));
    }

    #[test]
    fn test_column_match_uses_old_values_for_deletes() {
        let strategy = ColumnMatchStrategy {
            column: "store_id".to_string(),
        };
        let row = RowMetadata::decode(
            &change("item", EventKind::Delete, None, Some("1,store-2,widget")),
            Some(item_table()),
        );
        let mut cache = PassCache::new();
        let result = strategy
            .route_to_nodes(&mut cache, &row, &candidates(&["store-1", "store-2"]), false)
            .unwrap();
        assert_eq!(result, Some(candidates(&["store-2"])));
    }

    #[test]
    fn test_column_match_abstains_without_layout() {
        let strategy = ColumnMatchStrategy {
            column: "store_id".to_string(),
        };
        let row = RowMetadata::decode(
            &change("item", EventKind::Insert, Some("1,store-1,widget"), None),
            None,
        );
        let mut cache = PassCache::new();
        let result = strategy
            .route_to_nodes(&mut cache, &row, &candidates(&["store-1"]), false)
            .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_column_value_null_is_none() {
        let row = RowMetadata::decode(
            &change("item", EventKind::Insert, Some("1,,widget"), None),
            Some(item_table()),
        );
        assert_eq!(row.column_value("store_id"), None);
        assert_eq!(row.column_value("name"), Some("widget"));
        assert_eq!(row.column_value("missing"), None);
    }

    #[test]
    fn test_rule_event_kind_filters() {
        let mut rule = RouteRule::new("r1", "default", "item", "stores");
        rule.route_deletes = false;
        assert!(rule.applies_to(EventKind::Insert));
        assert!(rule.applies_to(EventKind::Update));
        assert!(!rule.applies_to(EventKind::Delete));
        assert!(rule.applies_to(EventKind::Reload));
        assert!(rule.applies_to(EventKind::Sql));
    }

    #[test]
    fn test_static_rule_source_lookup_is_case_insensitive() {
        let source = StaticRuleSource::new()
            .add_rule(RouteRule::new("r1", "default", "Item", "stores"))
            .add_group("stores", &["store-1", "store-2"])
            .add_table(item_table());
        assert_eq!(source.rules_for_table("ITEM").len(), 1);
        assert_eq!(source.rules_for_table("other").len(), 0);
        assert_eq!(source.nodes_in_group("stores").len(), 2);
        assert!(source.table_def("item").is_some());
    }

    #[test]
    fn test_rules_keep_insertion_order() {
        let source = StaticRuleSource::new()
            .add_rule(RouteRule::new("r1", "default", "item", "stores"))
            .add_rule(RouteRule::new("r2", "default", "item", "corp"));
        let rules = source.rules_for_table("item");
        assert_eq!(rules[0].router_id, "r1");
        assert_eq!(rules[1].router_id, "r2");
    }

    #[test]
    fn test_registry_resolves_and_rejects() {
        let registry = StrategyRegistry::new();
        assert!(registry.contains("default"));
        assert!(registry.resolve("r1", "default").is_ok());
        let err = registry.resolve("r1", "bogus").unwrap_err();
        assert!(matches!(err, RouterError::Strategy { .. }));
    }
}
