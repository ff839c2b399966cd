//! Component association index
//!
//! Stores composition edges between components so callers can quickly find
//! the components composed by other components, such as the bus attached to
//! a generator. The table lives on its own in-memory database because it is
//! never persisted: it is a derived cache, rebuilt after deserialization by
//! calling [`ComponentAssociations::add`] for every live component.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use tracing::{debug, info};

use crate::component::Component;
use crate::storage::error::StoreResult;

const TABLE_NAME: &str = "component_associations";

/// Relational cache of direct composition edges
pub struct ComponentAssociations {
    conn: Connection,
}

impl ComponentAssociations {
    pub fn new() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            &format!(
                "CREATE TABLE {TABLE_NAME} (
                    id INTEGER PRIMARY KEY,
                    component_id INTEGER,
                    component_type TEXT,
                    attached_component_id INTEGER,
                    attached_component_type TEXT
                )"
            ),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE INDEX by_c_id ON {TABLE_NAME}(component_id, attached_component_id)"
            ),
            [],
        )?;
        debug!("created in-memory component associations table");
        Ok(Self { conn })
    }

    /// Store an edge for each directly attached sub-component
    ///
    /// Components declare their attachments through
    /// [`Component::attached_components`]: single-valued and list-valued
    /// sub-component fields only. Components without an assigned id
    /// contribute no edges.
    pub fn add(&mut self, components: &[&dyn Component]) -> StoreResult<()> {
        let mut rows: Vec<(i64, &'static str, i64, &'static str)> = Vec::new();
        for component in components {
            let Some(component_id) = component.id() else {
                debug!("skipping associations for unassigned {}", component.label());
                continue;
            };
            for attached in component.attached_components() {
                let Some(attached_id) = attached.id() else {
                    debug!("skipping unassigned attachment {}", attached.label());
                    continue;
                };
                rows.push((
                    component_id as i64,
                    component.component_type(),
                    attached_id as i64,
                    attached.component_type(),
                ));
            }
        }

        if rows.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT INTO {TABLE_NAME} (
                    component_id, component_type,
                    attached_component_id, attached_component_type
                ) VALUES (?, ?, ?, ?)"
            ))?;
            for (component_id, component_type, attached_id, attached_type) in rows {
                stmt.execute(params![
                    component_id,
                    component_type,
                    attached_id,
                    attached_type
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Return the ids of all components this component composes
    ///
    /// For example, return the bus attached to a generator.
    pub fn list_child_components(
        &self,
        component: &dyn Component,
        component_type: Option<&str>,
    ) -> StoreResult<Vec<u64>> {
        self.list_edges(component, component_type, Direction::Children)
    }

    /// Return the ids of all components that compose this component
    ///
    /// For example, return all components connected to a bus.
    pub fn list_parent_components(
        &self,
        component: &dyn Component,
        component_type: Option<&str>,
    ) -> StoreResult<Vec<u64>> {
        self.list_edges(component, component_type, Direction::Parents)
    }

    /// Delete every edge where the component is either side
    pub fn remove(&mut self, component: &dyn Component) -> StoreResult<()> {
        let Some(id) = component.id() else {
            return Ok(());
        };
        self.conn.execute(
            &format!(
                "DELETE FROM {TABLE_NAME}
                 WHERE component_id = ? OR attached_component_id = ?"
            ),
            params![id as i64, id as i64],
        )?;
        debug!("removed all associations with component {}", component.label());
        Ok(())
    }

    /// Clear all component associations
    pub fn clear(&mut self) -> StoreResult<()> {
        self.conn
            .execute(&format!("DELETE FROM {TABLE_NAME}"), [])?;
        info!("cleared all component associations");
        Ok(())
    }

    fn list_edges(
        &self,
        component: &dyn Component,
        component_type: Option<&str>,
        direction: Direction,
    ) -> StoreResult<Vec<u64>> {
        let Some(id) = component.id() else {
            return Ok(Vec::new());
        };
        let (select_column, match_column, type_column) = match direction {
            Direction::Children => ("attached_component_id", "component_id", "attached_component_type"),
            Direction::Parents => ("component_id", "attached_component_id", "component_type"),
        };

        let mut where_clause = format!("{match_column} = ?");
        let mut query_params: Vec<SqlValue> = vec![SqlValue::from(id as i64)];
        if let Some(ty) = component_type {
            where_clause.push_str(&format!(" AND {type_column} = ?"));
            query_params.push(SqlValue::from(ty.to_string()));
        }

        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {select_column} FROM {TABLE_NAME} WHERE {where_clause}"
        ))?;
        let ids: Vec<i64> = stmt
            .query_map(params_from_iter(query_params), |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(ids.into_iter().map(|id| id as u64).collect())
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Children,
    Parents,
}
