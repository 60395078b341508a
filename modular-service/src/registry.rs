//! Module registry: discovers installed modules, verifies their descriptors
//! and dependencies, and publishes the command catalog.
//!
//! The catalog is immutable; install and uninstall build a fresh candidate,
//! verify it fully, then rotate one pointer. Readers observe either the old
//! catalog or the new one, never a mixture.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use modular_core::catalog::{Catalog, CatalogBuilder, CatalogError, CommandTree};
use modular_core::descriptor::ModuleDescriptor;
use modular_core::policy::{evaluate, Statement};
use serde_json::Value;

use crate::errors::{ApiError, ApiResult};

const DESCRIPTOR_FILE: &str = "descriptor.json";
const COMMANDS_FILE: &str = "commands.json";

pub struct ModuleRegistry {
    modules_dir: PathBuf,
    catalog: ArcSwap<Catalog>,
}

struct InstalledModule {
    descriptor: ModuleDescriptor,
    tree: CommandTree,
}

impl ModuleRegistry {
    /// Scan the modules directory and publish the initial catalog. Modules
    /// with unsatisfied dependencies are skipped with an error log; they do
    /// not prevent the rest from loading.
    pub async fn open(modules_dir: impl Into<PathBuf>) -> ApiResult<Self> {
        let modules_dir = modules_dir.into();
        tokio::fs::create_dir_all(&modules_dir).await.map_err(ApiError::internal)?;
        let registry = Self { modules_dir, catalog: ArcSwap::from_pointee(Catalog::default()) };
        registry.reload().await?;
        Ok(registry)
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.load_full()
    }

    pub async fn installed(&self) -> ApiResult<Vec<ModuleDescriptor>> {
        Ok(self.load_installed().await?.into_iter().map(|module| module.descriptor).collect())
    }

    /// Install the module described at `descriptor_path`. The descriptor and
    /// its command tree are verified, dependencies are checked against the
    /// installed set, a candidate catalog including the newcomer is built,
    /// and only then are the files copied in and the catalog swapped.
    pub async fn install(&self, descriptor_path: &Path) -> ApiResult<ModuleDescriptor> {
        let descriptor = read_descriptor(descriptor_path).await?;
        let tree_path = descriptor_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&descriptor.cli_path);
        let tree = read_tree(&tree_path).await?;

        let installed = self.load_installed().await?;
        if installed.iter().any(|m| m.descriptor.module_name == descriptor.module_name) {
            return Err(ApiError::AlreadyExists {
                entity: "module",
                name: descriptor.module_name.clone(),
            });
        }
        check_dependencies(&descriptor, &installed)?;

        let mut candidate: Vec<&InstalledModule> = installed.iter().collect();
        let newcomer = InstalledModule { descriptor: descriptor.clone(), tree: tree.clone() };
        candidate.push(&newcomer);
        let catalog = build_catalog(&candidate)?;

        let module_dir = self.modules_dir.join(&descriptor.module_name);
        tokio::fs::create_dir_all(&module_dir).await.map_err(ApiError::internal)?;
        let mut persisted = descriptor.clone();
        persisted.cli_path = COMMANDS_FILE.to_string();
        write_json(&module_dir.join(DESCRIPTOR_FILE), &persisted).await?;
        write_json(&module_dir.join(COMMANDS_FILE), &tree).await?;

        self.catalog.store(Arc::new(catalog));
        tracing::info!(module = %descriptor.module_name, version = %descriptor.version,
            "module installed");
        Ok(descriptor)
    }

    pub async fn uninstall(&self, module_name: &str) -> ApiResult<()> {
        let installed = self.load_installed().await?;
        if !installed.iter().any(|m| m.descriptor.module_name == module_name) {
            return Err(ApiError::NotInstalled(module_name.to_string()));
        }
        let dependents: Vec<&str> = installed
            .iter()
            .filter(|m| {
                m.descriptor.dependencies.iter().any(|d| d.module_name == module_name)
            })
            .map(|m| m.descriptor.module_name.as_str())
            .collect();
        if !dependents.is_empty() {
            return Err(ApiError::InvalidState {
                entity: "module",
                name: module_name.to_string(),
                state: "required".to_string(),
                detail: format!("still required by {}", dependents.join(", ")),
            });
        }

        tokio::fs::remove_dir_all(self.modules_dir.join(module_name))
            .await
            .map_err(ApiError::internal)?;
        self.reload().await?;
        tracing::info!(module = module_name, "module uninstalled");
        Ok(())
    }

    /// API meta filtered to the commands the given effective statements
    /// allow.
    pub fn meta_for(&self, statements: &[Statement]) -> Value {
        self.catalog()
            .api_meta(|module, path| evaluate(statements, module, path).is_allowed())
    }

    async fn reload(&self) -> ApiResult<()> {
        let installed = self.load_installed().await?;
        let satisfied = resolve_load_order(installed);
        let refs: Vec<&InstalledModule> = satisfied.iter().collect();
        let catalog = build_catalog(&refs)?;
        self.catalog.store(Arc::new(catalog));
        Ok(())
    }

    async fn load_installed(&self) -> ApiResult<Vec<InstalledModule>> {
        let mut modules = Vec::new();
        let mut entries =
            tokio::fs::read_dir(&self.modules_dir).await.map_err(ApiError::internal)?;
        while let Some(entry) = entries.next_entry().await.map_err(ApiError::internal)? {
            if !entry.file_type().await.map_err(ApiError::internal)?.is_dir() {
                continue;
            }
            let descriptor_path = entry.path().join(DESCRIPTOR_FILE);
            let descriptor = match read_descriptor(&descriptor_path).await {
                Ok(descriptor) => descriptor,
                Err(error) => {
                    tracing::error!(path = %descriptor_path.display(), %error,
                        "skipping module with unreadable descriptor");
                    continue;
                }
            };
            let tree = match read_tree(&entry.path().join(COMMANDS_FILE)).await {
                Ok(tree) => tree,
                Err(error) => {
                    tracing::error!(module = %descriptor.module_name, %error,
                        "skipping module with unreadable command tree");
                    continue;
                }
            };
            modules.push(InstalledModule { descriptor, tree });
        }
        modules.sort_by(|a, b| a.descriptor.module_name.cmp(&b.descriptor.module_name));
        Ok(modules)
    }
}

/// Keep only modules whose dependency closure is satisfied, iterating to a
/// fixpoint so that removing one module also drops its dependents.
fn resolve_load_order(mut modules: Vec<InstalledModule>) -> Vec<InstalledModule> {
    loop {
        let satisfied: Vec<bool> = modules
            .iter()
            .map(|module| check_dependencies(&module.descriptor, &modules).is_ok())
            .collect();
        if satisfied.iter().all(|ok| *ok) {
            return modules;
        }
        let mut keep = satisfied.iter();
        modules.retain(|module| {
            let ok = *keep.next().expect("same length");
            if !ok {
                tracing::error!(module = %module.descriptor.module_name,
                    "skipping module with unsatisfied dependencies");
            }
            ok
        });
    }
}

fn check_dependencies(
    descriptor: &ModuleDescriptor,
    installed: &[InstalledModule],
) -> ApiResult<()> {
    for dependency in &descriptor.dependencies {
        let found = installed
            .iter()
            .find(|m| m.descriptor.module_name == dependency.module_name)
            .map(|m| m.descriptor.version.clone());
        match found {
            Some(version) if version >= dependency.min_version => {}
            other => {
                return Err(ApiError::DependencyMissing {
                    module: descriptor.module_name.clone(),
                    dependency: dependency.module_name.clone(),
                    required: dependency.min_version.to_string(),
                    installed: other.map_or_else(|| "none".to_string(), |v| v.to_string()),
                });
            }
        }
    }
    Ok(())
}

fn build_catalog(modules: &[&InstalledModule]) -> ApiResult<Catalog> {
    let mut builder = CatalogBuilder::new();
    for module in modules {
        builder
            .add_module(
                &module.descriptor.module_name,
                module.descriptor.version.clone(),
                &module.descriptor.mount_point,
                module.tree.clone(),
            )
            .map_err(map_catalog_error)?;
    }
    Ok(builder.build())
}

fn map_catalog_error(error: CatalogError) -> ApiError {
    match error {
        CatalogError::MountPointConflict { mount_point, existing, .. } => {
            ApiError::MountPointConflict { mount_point, existing }
        }
        other => ApiError::InvalidDescriptor { reason: other.to_string() },
    }
}

async fn read_descriptor(path: &Path) -> ApiResult<ModuleDescriptor> {
    let bytes = tokio::fs::read(path).await.map_err(|source| ApiError::InvalidDescriptor {
        reason: format!("cannot read {}: {source}", path.display()),
    })?;
    let descriptor: ModuleDescriptor =
        serde_json::from_slice(&bytes).map_err(|source| ApiError::InvalidDescriptor {
            reason: format!("cannot parse {}: {source}", path.display()),
        })?;
    descriptor
        .validate()
        .map_err(|source| ApiError::InvalidDescriptor { reason: source.to_string() })?;
    Ok(descriptor)
}

async fn read_tree(path: &Path) -> ApiResult<CommandTree> {
    let bytes = tokio::fs::read(path).await.map_err(|source| ApiError::InvalidDescriptor {
        reason: format!("cannot read command tree {}: {source}", path.display()),
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ApiError::InvalidDescriptor {
        reason: format!("cannot parse command tree {}: {source}", path.display()),
    })
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> ApiResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(ApiError::internal)?;
    tokio::fs::write(path, bytes).await.map_err(ApiError::internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    async fn stage_module(
        dir: &Path,
        name: &str,
        version: &str,
        mount: &str,
        dependencies: Value,
    ) -> PathBuf {
        let module_dir = dir.join(format!("src-{name}"));
        tokio::fs::create_dir_all(&module_dir).await.unwrap();
        let descriptor_path = module_dir.join("descriptor.json");
        tokio::fs::write(
            &descriptor_path,
            serde_json::to_vec_pretty(&json!({
                "module_name": name,
                "cli_path": "commands.json",
                "mount_point": mount,
                "dependencies": dependencies,
                "version": version,
            }))
            .unwrap(),
        )
        .await
        .unwrap();
        tokio::fs::write(
            module_dir.join("commands.json"),
            serde_json::to_vec_pretty(&json!({
                "base_url": "http://127.0.0.1:9000",
                "commands": [
                    {"kind": "command", "name": "status",
                     "route": {"method": "GET", "path": format!("{mount}/status")}}
                ]
            }))
            .unwrap(),
        )
        .await
        .unwrap();
        descriptor_path
    }

    #[tokio::test]
    async fn install_uninstall_round_trip() {
        let workspace = tempfile::tempdir().unwrap();
        let registry = ModuleRegistry::open(workspace.path().join("modules")).await.unwrap();
        assert!(registry.catalog().is_empty());

        let descriptor =
            stage_module(workspace.path(), "m3admin", "3.0.0", "/m3admin", json!([])).await;
        registry.install(&descriptor).await.unwrap();
        assert!(registry.catalog().lookup("GET", "/m3admin/status").is_some());

        registry.uninstall("m3admin").await.unwrap();
        assert!(registry.catalog().lookup("GET", "/m3admin/status").is_none());
        assert!(matches!(
            registry.uninstall("m3admin").await.unwrap_err(),
            ApiError::NotInstalled(_)
        ));

        // install after uninstall restores the catalog
        registry.install(&descriptor).await.unwrap();
        assert!(registry.catalog().lookup("GET", "/m3admin/status").is_some());
    }

    #[tokio::test]
    async fn dependency_below_min_version_fails_install() {
        let workspace = tempfile::tempdir().unwrap();
        let registry = ModuleRegistry::open(workspace.path().join("modules")).await.unwrap();

        let old =
            stage_module(workspace.path(), "m3admin", "2.9.0", "/m3admin", json!([])).await;
        registry.install(&old).await.unwrap();

        let billing = stage_module(
            workspace.path(),
            "billing",
            "1.0.0",
            "/billing",
            json!([{"module_name": "m3admin", "min_version": "3.0.0"}]),
        )
        .await;
        let err = registry.install(&billing).await.unwrap_err();
        assert!(matches!(err, ApiError::DependencyMissing { .. }));

        // upgrade m3admin, then billing installs and its routes appear
        registry.uninstall("m3admin").await.unwrap();
        let new =
            stage_module(workspace.path(), "m3admin", "3.0.0", "/m3admin", json!([])).await;
        registry.install(&new).await.unwrap();
        registry.install(&billing).await.unwrap();
        assert!(registry.catalog().lookup("GET", "/billing/status").is_some());

        // and m3admin can no longer be removed from under billing
        assert!(matches!(
            registry.uninstall("m3admin").await.unwrap_err(),
            ApiError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn mount_point_conflict_fails_install() {
        let workspace = tempfile::tempdir().unwrap();
        let registry = ModuleRegistry::open(workspace.path().join("modules")).await.unwrap();

        let first =
            stage_module(workspace.path(), "m3admin", "3.0.0", "/shared", json!([])).await;
        registry.install(&first).await.unwrap();

        // same mount, different module and route set
        let module_dir = workspace.path().join("src-clash");
        tokio::fs::create_dir_all(&module_dir).await.unwrap();
        tokio::fs::write(
            module_dir.join("descriptor.json"),
            serde_json::to_vec_pretty(&json!({
                "module_name": "clash",
                "cli_path": "commands.json",
                "mount_point": "/shared",
                "version": "1.0.0",
            }))
            .unwrap(),
        )
        .await
        .unwrap();
        tokio::fs::write(
            module_dir.join("commands.json"),
            serde_json::to_vec_pretty(&json!({
                "base_url": "http://127.0.0.1:9001",
                "commands": [
                    {"kind": "command", "name": "other",
                     "route": {"method": "GET", "path": "/shared/other"}}
                ]
            }))
            .unwrap(),
        )
        .await
        .unwrap();
        let err = registry.install(&module_dir.join("descriptor.json")).await.unwrap_err();
        assert!(matches!(err, ApiError::MountPointConflict { .. }));
    }

    #[tokio::test]
    async fn reload_skips_modules_with_broken_dependencies() {
        let workspace = tempfile::tempdir().unwrap();
        let modules_dir = workspace.path().join("modules");
        let registry = ModuleRegistry::open(&modules_dir).await.unwrap();

        let m3admin =
            stage_module(workspace.path(), "m3admin", "3.0.0", "/m3admin", json!([])).await;
        let billing = stage_module(
            workspace.path(),
            "billing",
            "1.0.0",
            "/billing",
            json!([{"module_name": "m3admin", "min_version": "3.0.0"}]),
        )
        .await;
        registry.install(&m3admin).await.unwrap();
        registry.install(&billing).await.unwrap();

        // simulate out-of-band removal of the dependency, then a restart
        tokio::fs::remove_dir_all(modules_dir.join("m3admin")).await.unwrap();
        let reopened = ModuleRegistry::open(&modules_dir).await.unwrap();
        assert!(reopened.catalog().lookup("GET", "/billing/status").is_none());
    }
}
