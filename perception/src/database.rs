use std::path::Path;

use anyhow::{Result, bail};
use log::info;
use rusqlite::{Connection, Params as SqlParams, Statement, types::Null};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::models::Params;

const PRESETS: &str = "presets";

pub trait Identifiable {
    fn id(&self) -> Option<i64>;

    fn set_id(&mut self, id: i64);
}

#[macro_export]
macro_rules! impl_identifiable {
    ($type:ty) => {
        impl $crate::database::Identifiable for $type {
            fn id(&self) -> Option<i64> {
                self.id
            }

            fn set_id(&mut self, id: i64) {
                self.id = Some(id);
            }
        }
    };
}

/// A named set of pipeline parameters.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Preset {
    #[serde(skip_serializing, default)]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub params: Params,
}

impl_identifiable!(Preset);

/// SQLite backed storage of parameter presets.
///
/// Each table stores rows as `(id, data)` where `data` is the JSON of the row value.
#[derive(Debug)]
pub struct ParamsStore {
    conn: Connection,
}

impl ParamsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(target: "database", "opening preset store {}", path.display());
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {PRESETS} (
                    id INTEGER PRIMARY KEY,
                    data TEXT NOT NULL
                );
                "#
            )
            .as_str(),
        )?;
        Ok(Self { conn })
    }

    pub fn query_presets(&self) -> Result<Vec<Preset>> {
        self.query_from_table(PRESETS)
    }

    /// Finds the first preset called `name`.
    pub fn query_preset(&self, name: &str) -> Result<Option<Preset>> {
        Ok(self
            .query_presets()?
            .into_iter()
            .find(|preset| preset.name == name))
    }

    /// Queries `name`, inserting a preset with default parameters if it does not exist.
    pub fn query_or_upsert_preset(&self, name: &str) -> Result<Preset> {
        if let Some(preset) = self.query_preset(name)? {
            return Ok(preset);
        }

        let mut preset = Preset {
            id: None,
            name: name.to_string(),
            params: Params::default(),
        };
        self.upsert_preset(&mut preset)?;
        Ok(preset)
    }

    /// Inserts or updates `preset`, assigning its `id` on insert.
    ///
    /// Parameters are validated before being written.
    pub fn upsert_preset(&self, preset: &mut Preset) -> Result<()> {
        preset.params.validate()?;
        self.upsert_to_table(PRESETS, preset)
    }

    pub fn delete_preset(&self, preset: &Preset) -> Result<()> {
        self.delete_from_table(PRESETS, preset)
    }

    fn query_from_table<T>(&self, table: &str) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Identifiable + Default,
    {
        let stmt = format!("SELECT id, data FROM {table};");
        let stmt = self.conn.prepare(&stmt)?;
        map_data(stmt, [])
    }

    fn upsert_to_table<T>(&self, table: &str, data: &mut T) -> Result<()>
    where
        T: Serialize + Identifiable,
    {
        let json = serde_json::to_string(&data)?;
        let stmt = format!(
            "INSERT INTO {table} (id, data) VALUES (?1, ?2) ON CONFLICT (id) DO UPDATE SET data = ?2;",
        );
        match data.id() {
            Some(id) => {
                if self.conn.execute(&stmt, (id, &json))? > 0 {
                    Ok(())
                } else {
                    bail!("no row was updated")
                }
            }
            None => {
                if self.conn.execute(&stmt, (Null, &json))? > 0 {
                    data.set_id(self.conn.last_insert_rowid());
                    Ok(())
                } else {
                    bail!("no row was inserted")
                }
            }
        }
    }

    fn delete_from_table<T: Identifiable>(&self, table: &str, data: &T) -> Result<()> {
        if let Some(id) = data.id() {
            let stmt = format!("DELETE FROM {table} WHERE id = ?1;");
            if self.conn.execute(&stmt, [id])? > 0 {
                return Ok(());
            }
        }
        bail!("no row was deleted")
    }
}

fn map_data<T>(mut stmt: Statement<'_>, params: impl SqlParams) -> Result<Vec<T>>
where
    T: DeserializeOwned + Identifiable + Default,
{
    Ok(stmt
        .query_map::<T, _, _>(params, |row| {
            let id = row.get::<_, i64>(0)?;
            let data = row.get::<_, String>(1)?;
            let mut value = serde_json::from_str::<'_, T>(data.as_str()).unwrap_or_default();
            value.set_id(id);
            Ok(value)
        })?
        .filter_map(|c| c.ok())
        .collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrackingSpace;

    #[test]
    fn upsert_assigns_id_and_updates() {
        let store = ParamsStore::open_in_memory().unwrap();
        let mut preset = Preset {
            id: None,
            name: "arena".to_string(),
            params: Params::default(),
        };
        store.upsert_preset(&mut preset).unwrap();
        assert!(preset.id.is_some());

        preset.params.tracker.space = TrackingSpace::World;
        preset.params.decision.threshold = 2.5;
        store.upsert_preset(&mut preset).unwrap();

        let presets = store.query_presets().unwrap();
        assert_eq!(presets, vec![preset]);
    }

    #[test]
    fn invalid_params_are_not_written() {
        let store = ParamsStore::open_in_memory().unwrap();
        let mut preset = Preset::default();
        preset.params.tracker.alpha = 2.0;

        assert!(store.upsert_preset(&mut preset).is_err());
        assert!(preset.id.is_none());
        assert!(store.query_presets().unwrap().is_empty());
    }

    #[test]
    fn query_or_upsert_inserts_defaults_once() {
        let store = ParamsStore::open_in_memory().unwrap();
        let first = store.query_or_upsert_preset("default").unwrap();
        let second = store.query_or_upsert_preset("default").unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.params, Params::default());
        assert_eq!(store.query_presets().unwrap().len(), 1);
    }

    #[test]
    fn delete_removes_row() {
        let store = ParamsStore::open_in_memory().unwrap();
        let mut preset = store.query_or_upsert_preset("field").unwrap();
        store.delete_preset(&preset).unwrap();
        assert!(store.query_preset("field").unwrap().is_none());

        assert!(store.delete_preset(&preset).is_err());
        preset.id = None;
        assert!(store.delete_preset(&preset).is_err());
    }

    #[test]
    fn partially_written_rows_keep_defaults() {
        let store = ParamsStore::open_in_memory().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO presets (id, data) VALUES (7, ?1);",
                [r#"{"name":"old","params":{"tracker":{"alpha":0.5}}}"#],
            )
            .unwrap();

        let preset = store.query_preset("old").unwrap().unwrap();
        assert_eq!(preset.id, Some(7));
        assert_eq!(preset.params.tracker.alpha, 0.5);
        assert_eq!(preset.params.tracker.max_lost, 30);
        assert_eq!(preset.params.rectangle.max_area, 500000.0);
    }
}
