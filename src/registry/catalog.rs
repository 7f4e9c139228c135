use super::graph::DependencyGraph;
use super::module::{ModuleDef, ModuleDescriptor};
use crate::error::CloudrowError;
use crate::mapper::DynMapper;
use cloudrow_schema::{TableSpec, is_valid_identifier};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Every module this build knows about, validated once at startup.
pub struct Catalog {
    modules: BTreeMap<String, ModuleDef>,
    /// table name -> owning module
    table_owner: BTreeMap<String, String>,
}

impl Catalog {
    /// Validates names, table specs and table ownership. Dependency cycles are reported when an
    /// ordering is requested, naming the modules involved.
    pub fn new(defs: impl IntoIterator<Item = ModuleDef>) -> Result<Self, CloudrowError> {
        let mut modules = BTreeMap::new();
        let mut table_owner: BTreeMap<String, String> = BTreeMap::new();

        for def in defs {
            if modules.contains_key(&def.name) {
                return Err(CloudrowError::InvalidModule(format!(
                    "module {} is defined twice",
                    def.name
                )));
            }
            if !is_valid_identifier(&def.name) {
                return Err(CloudrowError::InvalidModule(format!(
                    "invalid module name {:?}",
                    def.name
                )));
            }
            for mapper in &def.mappers {
                let table = mapper.table();
                table.validate()?;
                if table.name != mapper.entity_type() {
                    return Err(CloudrowError::InvalidModule(format!(
                        "entity type {} is stored in table {}",
                        mapper.entity_type(),
                        table.name
                    )));
                }
                if let Some(owner) = table_owner.insert(table.name.clone(), def.name.clone()) {
                    return Err(CloudrowError::InvalidModule(format!(
                        "table {} is defined by both {owner} and {}",
                        table.name, def.name
                    )));
                }
            }
            modules.insert(def.name.clone(), def);
        }

        let catalog = Self {
            modules,
            table_owner,
        };
        catalog.check_references()?;
        Ok(catalog)
    }

    /// Foreign keys must target a table of the same module or of one it depends on.
    fn check_references(&self) -> Result<(), CloudrowError> {
        for def in self.modules.values() {
            let reachable = self.dependency_closure([def.name.as_str()]);
            for mapper in &def.mappers {
                for (col, fk) in mapper.table().foreign_keys() {
                    let owner = self.table_owner.get(&fk.table);
                    if !owner.is_some_and(|o| reachable.contains(o.as_str())) {
                        return Err(CloudrowError::InvalidModule(format!(
                            "{}.{} references {} which is not provided by {} or its dependencies",
                            mapper.entity_type(),
                            col.field,
                            fk.table,
                            def.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDef> {
        self.modules.get(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleDef> {
        self.modules.values()
    }

    pub fn table(&self, name: &str) -> Option<&Arc<TableSpec>> {
        let owner = self.table_owner.get(name)?;
        self.modules
            .get(owner)?
            .mappers
            .iter()
            .map(|m| m.table())
            .find(|t| t.name == name)
    }

    pub fn mapper(&self, entity_type: &str) -> Option<&Arc<dyn DynMapper>> {
        let owner = self.table_owner.get(entity_type)?;
        self.modules
            .get(owner)?
            .mappers
            .iter()
            .find(|m| m.entity_type() == entity_type)
    }

    pub fn is_regional(&self, table: &str) -> bool {
        self.table(table).is_some_and(|t| t.regional)
    }

    /// Names not defined in the catalog, sorted.
    pub fn unknown<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        names
            .into_iter()
            .filter(|n| !self.modules.contains_key(*n))
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// The named modules plus everything they transitively depend on.
    pub fn dependency_closure<'a>(&'a self, names: impl IntoIterator<Item = &'a str>) -> BTreeSet<&'a str> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = names.into_iter().collect();
        while let Some(name) = stack.pop() {
            let Some(def) = self.modules.get(name) else {
                continue;
            };
            if seen.insert(def.name.as_str()) {
                stack.extend(def.dependencies.iter().map(String::as_str));
            }
        }
        seen
    }

    /// Topological order of a subset (dependencies first, ties by name).
    pub fn order<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<Vec<String>, CloudrowError> {
        let mut graph = DependencyGraph::new();
        let names: BTreeSet<&str> = names.into_iter().collect();
        for name in &names {
            graph.add_node(*name);
        }
        for name in &names {
            if let Some(def) = self.modules.get(*name) {
                for dep in &def.dependencies {
                    graph.add_edge(name, dep);
                }
            }
        }
        graph.topological_sort()
    }

    /// Every module in install order, without target state.
    pub fn descriptors(&self) -> Result<Vec<ModuleDescriptor>, CloudrowError> {
        let order = self.order(self.modules.keys().map(String::as_str))?;
        Ok(order
            .iter()
            .filter_map(|name| self.modules.get(name))
            .map(|def| ModuleDescriptor {
                name: def.name.clone(),
                version: def.version.clone(),
                dependencies: def.dependencies.clone(),
                tables: def.table_names().map(str::to_string).collect(),
                rpcs: def.rpcs.keys().cloned().collect(),
                installed: false,
                enabled: false,
            })
            .collect())
    }
}
