//! Module registry: which modules exist, which are installed and enabled for a target, and
//! the order in which they are installed and removed.
//!
//! Installed/enabled state lives only in the target's store; every call re-reads it.

pub mod catalog;
pub mod graph;
pub mod module;

pub use catalog::Catalog;
pub use graph::DependencyGraph;
pub use module::{ModuleDef, ModuleDescriptor, RpcContext, RpcHandler};

use crate::db::{InstalledModule, ModuleInstall, ModuleUninstall, StoreHandle};
use crate::error::CloudrowError;
use crate::mapper::DynMapper;
use cloudrow_schema::TableSpec;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    /// Newly installed, in install order.
    pub installed: Vec<String>,
    /// Requested (or required) but already installed.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UninstallReport {
    /// Removed, in removal order (includes cascaded modules).
    pub uninstalled: Vec<String>,
    /// Disabled dependents removed along with the requested modules.
    pub cascaded: Vec<String>,
    /// Requested but not installed.
    pub skipped: Vec<String>,
}

#[derive(Clone)]
pub struct Registry {
    catalog: Arc<Catalog>,
}

fn by_name(rows: Vec<InstalledModule>) -> BTreeMap<String, InstalledModule> {
    rows.into_iter().map(|m| (m.name.clone(), m)).collect()
}

impl Registry {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog: Arc::new(catalog),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Every known module, dependencies first.
    pub fn list_available(&self) -> Result<Vec<ModuleDescriptor>, CloudrowError> {
        self.catalog.descriptors()
    }

    /// Known modules annotated with this target's state, plus installed modules this build no
    /// longer defines.
    pub async fn list_modules(
        &self,
        store: &StoreHandle,
    ) -> Result<Vec<ModuleDescriptor>, CloudrowError> {
        let mut installed = by_name(store.list_modules().await?);
        let mut out = self.list_available()?;
        for desc in &mut out {
            if let Some(row) = installed.remove(&desc.name) {
                desc.installed = true;
                desc.enabled = row.enabled;
            }
        }
        out.extend(installed.into_values().map(|row| ModuleDescriptor {
            name: row.name,
            version: row.version,
            dependencies: row.dependencies,
            tables: row.tables,
            rpcs: Vec::new(),
            installed: true,
            enabled: row.enabled,
        }));
        Ok(out)
    }

    /// Installs `names` and their missing dependencies in one storage transaction.
    pub async fn install(
        &self,
        store: &StoreHandle,
        names: &[String],
    ) -> Result<InstallReport, CloudrowError> {
        let unknown = self.catalog.unknown(names.iter().map(String::as_str));
        if !unknown.is_empty() {
            return Err(CloudrowError::UnknownModule { names: unknown });
        }

        let installed = by_name(store.list_modules().await?);
        let closure = self
            .catalog
            .dependency_closure(names.iter().map(String::as_str));
        let order = self.catalog.order(closure)?;

        let requested: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        let mut report = InstallReport::default();
        let mut rows = Vec::new();
        for name in order {
            if installed.contains_key(&name) {
                info!(module = %name, target_name = %store.target(), "module already installed, skipping");
                report.skipped.push(name);
                continue;
            }
            let Some(def) = self.catalog.get(&name) else {
                continue;
            };
            if !requested.contains(name.as_str()) {
                info!(module = %name, target_name = %store.target(), "installing required dependency");
            }

            let disabled: Vec<String> = def
                .dependencies
                .iter()
                .filter(|d| installed.get(*d).is_some_and(|m| !m.enabled))
                .cloned()
                .collect();
            if !disabled.is_empty() {
                return Err(CloudrowError::DependencyNotEnabled {
                    module: name,
                    dependencies: disabled,
                });
            }

            let tables = def
                .mappers
                .iter()
                .map(|m| {
                    let spec = m.table();
                    (
                        spec.name.clone(),
                        spec.create_statements(|t| self.catalog.is_regional(t)),
                    )
                })
                .collect();
            rows.push(ModuleInstall {
                name: name.clone(),
                version: def.version.clone(),
                dependencies: def.dependencies.clone(),
                tables,
            });
            report.installed.push(name);
        }

        if !rows.is_empty() {
            store.install_modules(rows).await?;
        }
        info!(
            target_name = %store.target(),
            installed = ?report.installed,
            skipped = ?report.skipped,
            "modules installed"
        );
        Ok(report)
    }

    /// Uninstalls `names` in one storage transaction, dependents first.
    ///
    /// Refused while an enabled module outside the request depends on one of them; disabled
    /// dependents are removed with them.
    pub async fn uninstall(
        &self,
        store: &StoreHandle,
        names: &[String],
    ) -> Result<UninstallReport, CloudrowError> {
        let installed = by_name(store.list_modules().await?);
        let unknown: Vec<String> = self
            .catalog
            .unknown(names.iter().map(String::as_str))
            .into_iter()
            .filter(|n| !installed.contains_key(n))
            .collect();
        if !unknown.is_empty() {
            return Err(CloudrowError::UnknownModule { names: unknown });
        }

        let mut report = UninstallReport::default();
        let mut removing: BTreeSet<&str> = BTreeSet::new();
        for name in names {
            if installed.contains_key(name) {
                removing.insert(name.as_str());
            } else {
                info!(module = %name, target_name = %store.target(), "module not installed, skipping");
                report.skipped.push(name.clone());
            }
        }
        let requested = removing.clone();

        // Pull in disabled dependents until nothing changes.
        loop {
            let cascade: Vec<&str> = installed
                .values()
                .filter(|m| !removing.contains(m.name.as_str()) && !m.enabled)
                .filter(|m| m.dependencies.iter().any(|d| removing.contains(d.as_str())))
                .map(|m| m.name.as_str())
                .collect();
            if cascade.is_empty() {
                break;
            }
            removing.extend(cascade);
        }

        for name in &removing {
            let dependents: Vec<String> = installed
                .values()
                .filter(|m| !removing.contains(m.name.as_str()))
                .filter(|m| m.dependencies.iter().any(|d| d == name))
                .map(|m| m.name.clone())
                .collect();
            if !dependents.is_empty() {
                return Err(CloudrowError::DependentModuleStillEnabled {
                    module: (*name).to_string(),
                    dependents,
                });
            }
        }

        let mut graph = DependencyGraph::new();
        for name in &removing {
            graph.add_node(*name);
        }
        for name in &removing {
            if let Some(row) = installed.get(*name) {
                for dep in &row.dependencies {
                    graph.add_edge(name, dep);
                }
            }
        }
        let mut order = graph.topological_sort()?;
        order.reverse();

        let rows: Vec<ModuleUninstall> = order
            .iter()
            .filter_map(|name| installed.get(name))
            .map(|row| ModuleUninstall {
                name: row.name.clone(),
                drops: row
                    .tables
                    .iter()
                    .rev()
                    .map(|t| TableSpec::new(t.as_str()).drop_statement())
                    .collect(),
            })
            .collect();
        if !rows.is_empty() {
            store.uninstall_modules(rows).await?;
        }

        for name in &order {
            if !requested.contains(name.as_str()) {
                warn!(module = %name, target_name = %store.target(), "uninstalled disabled dependent along with its dependency");
                report.cascaded.push(name.clone());
            }
        }
        report.uninstalled = order;
        info!(
            target_name = %store.target(),
            uninstalled = ?report.uninstalled,
            "modules uninstalled"
        );
        Ok(report)
    }

    /// Enabling requires every dependency enabled; disabling requires no enabled dependent.
    pub async fn set_enabled(
        &self,
        store: &StoreHandle,
        name: &str,
        enabled: bool,
    ) -> Result<(), CloudrowError> {
        let installed = by_name(store.list_modules().await?);
        let Some(module) = installed.get(name) else {
            return Err(CloudrowError::ModuleNotInstalled(name.to_string()));
        };

        if enabled {
            let missing: Vec<String> = module
                .dependencies
                .iter()
                .filter(|d| !installed.get(*d).is_some_and(|m| m.enabled))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(CloudrowError::DependencyNotEnabled {
                    module: name.to_string(),
                    dependencies: missing,
                });
            }
        } else {
            let dependents: Vec<String> = installed
                .values()
                .filter(|m| m.enabled && m.dependencies.iter().any(|d| d == name))
                .map(|m| m.name.clone())
                .collect();
            if !dependents.is_empty() {
                return Err(CloudrowError::DependentModuleStillEnabled {
                    module: name.to_string(),
                    dependents,
                });
            }
        }

        store.set_enabled(name, enabled).await?;
        info!(module = %name, enabled, target_name = %store.target(), "module state changed");
        Ok(())
    }

    /// Mappers of every enabled module, in module order.
    pub async fn enabled_mappers(
        &self,
        store: &StoreHandle,
    ) -> Result<Vec<Arc<dyn DynMapper>>, CloudrowError> {
        let enabled: Vec<String> = store
            .list_modules()
            .await?
            .into_iter()
            .filter(|m| m.enabled)
            .map(|m| m.name)
            .collect();
        for name in &enabled {
            if self.catalog.get(name).is_none() {
                warn!(module = %name, target_name = %store.target(), "installed module is not defined in this build, ignoring");
            }
        }
        self.mappers_for(&enabled)
    }

    /// Mappers of the named known modules, in module order.
    pub fn mappers_for(&self, names: &[String]) -> Result<Vec<Arc<dyn DynMapper>>, CloudrowError> {
        let order = self.catalog.order(
            names
                .iter()
                .map(String::as_str)
                .filter(|n| self.catalog.get(n).is_some()),
        )?;
        Ok(order
            .iter()
            .filter_map(|name| self.catalog.get(name))
            .flat_map(|def| def.mappers.iter().cloned())
            .collect())
    }

    /// The module owning `name`, if it is installed and enabled.
    pub async fn enabled_module(
        &self,
        store: &StoreHandle,
        name: &str,
    ) -> Result<&ModuleDef, CloudrowError> {
        let installed = by_name(store.list_modules().await?);
        match (installed.get(name), self.catalog.get(name)) {
            (None, _) => Err(CloudrowError::ModuleNotInstalled(name.to_string())),
            (Some(row), _) if !row.enabled => Err(CloudrowError::ModuleNotEnabled(name.to_string())),
            (Some(_), Some(def)) => Ok(def),
            (Some(_), None) => Err(CloudrowError::UnknownModule {
                names: vec![name.to_string()],
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_modules_list_dependencies_first() {
        let registry = Registry::new(
            Catalog::new([
                ModuleDef::new("storage", "1.0.0"),
                ModuleDef::new("dns", "1.0.0").depends_on("network"),
                ModuleDef::new("compute", "2.1.0").depends_on("network"),
                ModuleDef::new("network", "1.0.0"),
            ])
            .unwrap(),
        );

        let available = registry.list_available().unwrap();
        let names: Vec<&str> = available.iter().map(|m| m.name.as_str()).collect();
        // network unblocks compute and dns; ties among ready modules go by name.
        assert_eq!(names, ["network", "compute", "dns", "storage"]);
        assert_eq!(available[1].version, "2.1.0");
        assert_eq!(available[1].dependencies, ["network"]);
        assert!(available.iter().all(|m| !m.installed && !m.enabled));
    }

    #[test]
    fn cyclic_catalog_cannot_be_listed() {
        let registry = Registry::new(
            Catalog::new([
                ModuleDef::new("a", "1.0.0").depends_on("b"),
                ModuleDef::new("b", "1.0.0").depends_on("a"),
            ])
            .unwrap(),
        );
        assert!(matches!(
            registry.list_available(),
            Err(CloudrowError::DependencyCycle { ref participants }) if participants == &["a", "b"]
        ));
    }
}
