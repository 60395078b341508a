//! The command catalog: the canonical, immutable mapping from
//! `(module, command path)` to command metadata and from `(method, route)`
//! to the command serving it.
//!
//! A catalog is built once from the installed modules' command trees,
//! verified, and then published as a whole; request handling only ever reads
//! it. The tree is a sealed pair of variants: a node is either a group of
//! further nodes or a terminal command.

use std::collections::{BTreeMap, HashMap};

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::pattern::CommandPath;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("module {0:?} is already present in the catalog")]
    DuplicateModule(String),
    #[error("mount point {mount_point:?} is used by both {existing:?} and {incoming:?}")]
    MountPointConflict { mount_point: String, existing: String, incoming: String },
    #[error("route {method} {path} is declared more than once")]
    DuplicateRoute { method: String, path: String },
    #[error("command path {path:?} appears twice in module {module:?}")]
    DuplicateCommandPath { module: String, path: String },
    #[error("parameter {parameter:?} is declared twice on command {command:?}")]
    DuplicateParameter { command: String, parameter: String },
    #[error("invalid name {0:?}: names must be non-empty and free of whitespace, ':' and '/'")]
    InvalidName(String),
    #[error("route {route:?} of module {module:?} is outside its mount point {mount_point:?}")]
    RouteOutsideMount { module: String, route: String, mount_point: String },
    #[error("mount point {0:?} must start with '/' and contain no whitespace")]
    InvalidMountPoint(String),
}

/// Wire and storage types a command parameter can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "integer")]
    Integer,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "list-of-string")]
    StringList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

/// How the facade authenticates the forwarded call to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Inject a short-lived inter-service token derived from the caller.
    #[default]
    Bearer,
    /// Forward with no credentials.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthMode>,
}

impl Route {
    pub fn auth_mode(&self) -> AuthMode {
        self.auth.unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMeta {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    pub route: Route,
    /// Describe-class commands are read-only and are not audited.
    #[serde(default)]
    pub describe_class: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandGroup {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub items: Vec<CatalogNode>,
}

/// A node of a module's command tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CatalogNode {
    Group(CommandGroup),
    Command(CommandMeta),
}

impl CatalogNode {
    fn name(&self) -> &str {
        match self {
            Self::Group(group) => &group.name,
            Self::Command(command) => &command.name,
        }
    }

    fn order_key(&self) -> (u8, &str) {
        // terminal commands sort before sub-groups, then by name
        match self {
            Self::Command(command) => (0, command.name.as_str()),
            Self::Group(group) => (1, group.name.as_str()),
        }
    }
}

/// The command tree document a module ships at its `cli_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTree {
    /// Base URL of the backend service the module's routes forward to.
    pub base_url: String,
    #[serde(default)]
    pub commands: Vec<CatalogNode>,
}

/// One installed module inside a built catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub name: String,
    pub version: Version,
    pub mount_point: String,
    pub base_url: String,
    pub root: Vec<CatalogNode>,
}

/// Where a facade route leads: the owning module, the command's location in
/// its tree, and the command metadata itself.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub module: String,
    pub command_path: CommandPath,
    pub meta: CommandMeta,
}

/// The immutable catalog; built by [`CatalogBuilder`], swapped in whole.
#[derive(Debug, Default)]
pub struct Catalog {
    modules: BTreeMap<String, ModuleEntry>,
    routes: HashMap<(String, String), RouteEntry>,
}

impl Catalog {
    /// Exact-match route lookup; paths are not patterns.
    pub fn lookup(&self, method: &str, path: &str) -> Option<&RouteEntry> {
        self.routes.get(&(method.to_ascii_uppercase(), path.to_string()))
    }

    pub fn module(&self, name: &str) -> Option<&ModuleEntry> {
        self.modules.get(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleEntry> {
        self.modules.values()
    }

    pub fn routes(&self) -> impl Iterator<Item = &RouteEntry> {
        self.routes.values()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// The client-visible API meta: a nested mapping keyed by module name
    /// then node name, carrying descriptions, parameters and routes.
    /// `allows` filters out commands the caller may not invoke; groups and
    /// modules emptied by the filter are omitted.
    pub fn api_meta<F>(&self, mut allows: F) -> Value
    where
        F: FnMut(&str, &CommandPath) -> bool,
    {
        let mut root = Map::new();
        for entry in self.modules.values() {
            let mut groups = Vec::new();
            let items = meta_items(&entry.name, &entry.root, &mut groups, &mut allows);
            if items.is_empty() {
                continue;
            }
            root.insert(
                entry.name.clone(),
                json!({
                    "version": entry.version.to_string(),
                    "mount_point": entry.mount_point,
                    "items": Value::Object(items),
                }),
            );
        }
        Value::Object(root)
    }
}

fn meta_items<F>(
    module: &str,
    nodes: &[CatalogNode],
    groups: &mut Vec<String>,
    allows: &mut F,
) -> Map<String, Value>
where
    F: FnMut(&str, &CommandPath) -> bool,
{
    let mut items = Map::new();
    for node in nodes {
        match node {
            CatalogNode::Command(command) => {
                let path = CommandPath::new(groups.clone(), command.name.clone());
                if !allows(module, &path) {
                    continue;
                }
                items.insert(
                    command.name.clone(),
                    json!({
                        "kind": "command",
                        "description": command.description,
                        "parameters": command.parameters,
                        "route": { "method": command.route.method, "path": command.route.path },
                    }),
                );
            }
            CatalogNode::Group(group) => {
                groups.push(group.name.clone());
                let children = meta_items(module, &group.items, groups, allows);
                groups.pop();
                if children.is_empty() {
                    continue;
                }
                items.insert(
                    group.name.clone(),
                    json!({
                        "kind": "group",
                        "description": group.description,
                        "items": Value::Object(children),
                    }),
                );
            }
        }
    }
    items
}

fn validate_name(name: &str) -> Result<(), CatalogError> {
    if name.is_empty()
        || name.chars().any(|c| c.is_whitespace() || c.is_control() || c == ':' || c == '/')
    {
        return Err(CatalogError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Builds and verifies a candidate catalog before it is published.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    catalog: Catalog,
    mounts: HashMap<String, String>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_module(
        &mut self,
        name: &str,
        version: Version,
        mount_point: &str,
        tree: CommandTree,
    ) -> Result<(), CatalogError> {
        validate_name(name)?;
        if self.catalog.modules.contains_key(name) {
            return Err(CatalogError::DuplicateModule(name.to_string()));
        }
        if !mount_point.starts_with('/') || mount_point.chars().any(char::is_whitespace) {
            return Err(CatalogError::InvalidMountPoint(mount_point.to_string()));
        }
        if let Some(existing) = self.mounts.get(mount_point) {
            return Err(CatalogError::MountPointConflict {
                mount_point: mount_point.to_string(),
                existing: existing.clone(),
                incoming: name.to_string(),
            });
        }

        let mut root = tree.commands;
        sort_nodes(&mut root);
        let mut groups = Vec::new();
        let mut seen_paths = Vec::new();
        self.index_nodes(name, mount_point, &root, &mut groups, &mut seen_paths)?;

        self.mounts.insert(mount_point.to_string(), name.to_string());
        self.catalog.modules.insert(
            name.to_string(),
            ModuleEntry {
                name: name.to_string(),
                version,
                mount_point: mount_point.to_string(),
                base_url: tree.base_url,
                root,
            },
        );
        Ok(())
    }

    fn index_nodes(
        &mut self,
        module: &str,
        mount_point: &str,
        nodes: &[CatalogNode],
        groups: &mut Vec<String>,
        seen_paths: &mut Vec<CommandPath>,
    ) -> Result<(), CatalogError> {
        for node in nodes {
            validate_name(node.name())?;
            match node {
                CatalogNode::Group(group) => {
                    groups.push(group.name.clone());
                    self.index_nodes(module, mount_point, &group.items, groups, seen_paths)?;
                    groups.pop();
                }
                CatalogNode::Command(command) => {
                    let path = CommandPath::new(groups.clone(), command.name.clone());
                    if seen_paths.contains(&path) {
                        return Err(CatalogError::DuplicateCommandPath {
                            module: module.to_string(),
                            path: path.to_string(),
                        });
                    }
                    let mut names: Vec<&str> = Vec::with_capacity(command.parameters.len());
                    for parameter in &command.parameters {
                        if names.contains(&parameter.name.as_str()) {
                            return Err(CatalogError::DuplicateParameter {
                                command: path.to_string(),
                                parameter: parameter.name.clone(),
                            });
                        }
                        names.push(&parameter.name);
                    }
                    let mount_prefix = format!("{}/", mount_point.trim_end_matches('/'));
                    if !command.route.path.starts_with(&mount_prefix) {
                        return Err(CatalogError::RouteOutsideMount {
                            module: module.to_string(),
                            route: command.route.path.clone(),
                            mount_point: mount_point.to_string(),
                        });
                    }
                    let key = (command.route.method.to_ascii_uppercase(), command.route.path.clone());
                    if self.catalog.routes.contains_key(&key) {
                        return Err(CatalogError::DuplicateRoute {
                            method: key.0,
                            path: key.1,
                        });
                    }
                    self.catalog.routes.insert(
                        key,
                        RouteEntry {
                            module: module.to_string(),
                            command_path: path.clone(),
                            meta: command.clone(),
                        },
                    );
                    seen_paths.push(path);
                }
            }
        }
        Ok(())
    }

    pub fn build(self) -> Catalog {
        self.catalog
    }
}

fn sort_nodes(nodes: &mut [CatalogNode]) {
    nodes.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
    for node in nodes {
        if let CatalogNode::Group(group) = node {
            sort_nodes(&mut group.items);
        }
    }
}
