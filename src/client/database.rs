use super::collection::Collection;
use super::Client;
use crate::config::WriteConcern;
use crate::core::Preference;
use crate::cursor::CursorSession;
use crate::dispatch::Operation;
use crate::error::Result;
use bson::{doc, Bson, Document};
use tracing::debug;

/// Scale `stats` reports sizes in unless told otherwise
pub const DEFAULT_STATS_SCALE: i32 = 1024;

/// Options for an explicit `create`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateCollectionOptions {
    pub capped: bool,
    /// Size limit in bytes, required when capped
    pub size: Option<i64>,
    /// Document limit for a capped collection
    pub max: Option<i64>,
    pub validator: Option<Document>,
}

/// Handle on one database
#[derive(Clone)]
pub struct Database {
    client: Client,
    name: String,
    read_preference: Preference,
    write_concern: WriteConcern,
}

impl Database {
    pub(crate) fn new(client: Client, name: &str, read_preference: Preference, write_concern: WriteConcern) -> Self {
        Self {
            client,
            name: name.to_string(),
            read_preference,
            write_concern,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn read_preference(&self) -> &Preference {
        &self.read_preference
    }

    pub fn write_concern(&self) -> &WriteConcern {
        &self.write_concern
    }

    /// Copy of this handle whose reads use `preference`
    pub fn with_read_preference(mut self, preference: Preference) -> Self {
        self.read_preference = preference;
        self
    }

    pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = write_concern;
        self
    }

    /// Collection handle inheriting this database's preference and concern
    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(
            self.clone(),
            name,
            self.read_preference.clone(),
            self.write_concern.clone(),
        )
    }

    /// Run an arbitrary command on the primary. Never retried.
    pub async fn run_command(&self, command: Document) -> Result<Document> {
        let reply = self
            .client
            .dispatcher()
            .execute(Operation::write(self.name.as_str(), command))
            .await?;
        Ok(reply.document)
    }

    /// Run a read-only command routed by `preference`, retried on network
    /// failure
    pub async fn run_read_command(&self, command: Document, preference: Preference) -> Result<Document> {
        let reply = self
            .client
            .dispatcher()
            .execute(Operation::read(self.name.as_str(), command, preference))
            .await?;
        Ok(reply.document)
    }

    /// Names of the collections in this database, read through a
    /// `listCollections` cursor
    pub async fn collection_names(&self) -> Result<Vec<String>> {
        let command = doc! { "listCollections": 1, "nameOnly": true, "cursor": {} };
        let reply = self
            .client
            .dispatcher()
            .execute(Operation::read(self.name.as_str(), command, self.read_preference.clone()))
            .await?;
        let mut cursor = CursorSession::from_reply(
            self.client.dispatcher().clone(),
            &self.name,
            reply,
            self.read_preference.clone(),
            None,
        )?;
        let entries = cursor.to_vec().await?;
        Ok(entries
            .iter()
            .filter_map(|entry| entry.get_str("name").ok())
            .map(str::to_string)
            .collect())
    }

    /// Create a collection explicitly and return a handle on it
    pub async fn create_collection(&self, name: &str, options: CreateCollectionOptions) -> Result<Collection> {
        let mut command = doc! { "create": name };
        if options.capped {
            command.insert("capped", true);
        }
        if let Some(size) = options.size {
            command.insert("size", size);
        }
        if let Some(max) = options.max {
            command.insert("max", max);
        }
        if let Some(validator) = options.validator {
            command.insert("validator", validator);
        }
        if !self.write_concern.is_empty() {
            command.insert("writeConcern", self.write_concern.to_document());
        }
        self.run_command(command).await?;
        debug!("Created collection {}.{}", self.name, name);
        Ok(self.collection(name))
    }

    /// `dbStats` with sizes divided by `scale` (default 1024)
    pub async fn stats(&self, scale: Option<i32>) -> Result<Document> {
        let command = doc! { "dbStats": 1, "scale": Bson::Int32(scale.unwrap_or(DEFAULT_STATS_SCALE)) };
        self.run_read_command(command, self.read_preference.clone()).await
    }

    /// Drop the whole database
    pub async fn drop(&self) -> Result<()> {
        let mut command = doc! { "dropDatabase": 1 };
        if !self.write_concern.is_empty() {
            command.insert("writeConcern", self.write_concern.to_document());
        }
        self.run_command(command).await?;
        debug!("Dropped database {}", self.name);
        Ok(())
    }
}
