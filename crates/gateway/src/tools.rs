//! Tool registry and name resolution.
//!
//! Nodes advertise tools under their own names; the catalog exposed to
//! clients prefixes each with `{nodeId}__` so identical names on different
//! nodes stay distinct.

use std::collections::HashMap;

use serde::Serialize;

use switchyard_protocol::{ErrorShape, TOOL_NAMESPACE_SEPARATOR, ToolDefinition};

/// One entry of the client-visible catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub name: String,
    pub node_id: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Where an invocation goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTool {
    pub node_id: String,
    /// The un-namespaced name the node advertised.
    pub tool: String,
}

pub fn namespaced(node_id: &str, tool: &str) -> String {
    format!("{node_id}{TOOL_NAMESPACE_SEPARATOR}{tool}")
}

/// Raw per-node tool lists.
///
/// Entries outlive the node's connection and are only overwritten by the
/// next handshake from the same node id; every query takes a connectivity
/// predicate so disconnected nodes never surface.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    by_node: HashMap<String, Vec<ToolDefinition>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_node_tools(&mut self, node_id: &str, tools: Vec<ToolDefinition>) {
        self.by_node.insert(node_id.to_string(), tools);
    }

    pub fn node_tools(&self, node_id: &str) -> Option<&[ToolDefinition]> {
        self.by_node.get(node_id).map(Vec::as_slice)
    }

    fn has_tool(&self, node_id: &str, tool: &str) -> bool {
        self.by_node
            .get(node_id)
            .is_some_and(|tools| tools.iter().any(|t| t.name == tool))
    }

    /// Namespaced catalog of connected nodes, sorted by name.
    pub fn catalog(&self, is_connected: impl Fn(&str) -> bool) -> Vec<CatalogEntry> {
        let mut entries: Vec<CatalogEntry> = self
            .by_node
            .iter()
            .filter(|(node_id, _)| is_connected(node_id))
            .flat_map(|(node_id, tools)| {
                tools.iter().map(move |t| CatalogEntry {
                    name: namespaced(node_id, &t.name),
                    node_id: node_id.clone(),
                    description: t.description.clone(),
                    input_schema: t.input_schema.clone(),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Resolve a namespaced or bare tool name to a connected node.
    ///
    /// A namespaced name matches when its prefix is a connected node id that
    /// advertises the remainder; node ids may themselves contain the
    /// separator, so the longest matching node id wins. A bare name must be
    /// offered by exactly one connected node.
    pub fn resolve(
        &self,
        name: &str,
        is_connected: impl Fn(&str) -> bool,
    ) -> Result<ResolvedTool, ErrorShape> {
        let namespaced_hit = self
            .by_node
            .keys()
            .filter(|node_id| is_connected(node_id))
            .filter_map(|node_id| {
                let tool = name
                    .strip_prefix(node_id.as_str())?
                    .strip_prefix(TOOL_NAMESPACE_SEPARATOR)?;
                self.has_tool(node_id, tool).then_some((node_id, tool))
            })
            .max_by_key(|(node_id, _)| node_id.len());
        if let Some((node_id, tool)) = namespaced_hit {
            return Ok(ResolvedTool {
                node_id: node_id.clone(),
                tool: tool.to_string(),
            });
        }

        let mut owners: Vec<&String> = self
            .by_node
            .keys()
            .filter(|node_id| is_connected(node_id) && self.has_tool(node_id, name))
            .collect();
        match owners.len() {
            0 => Err(ErrorShape::not_found(format!("unknown tool: {name}"))),
            1 => Ok(ResolvedTool {
                node_id: owners[0].clone(),
                tool: name.to_string(),
            }),
            _ => {
                owners.sort();
                let options: Vec<String> = owners.iter().map(|n| namespaced(n, name)).collect();
                Err(ErrorShape::bad_request(format!(
                    "ambiguous tool {name}: use one of {}",
                    options.join(", ")
                )))
            },
        }
    }
}
