/// Collection operations built on top of the dispatcher
///
/// Reads are idempotent and routed by the collection's read preference.
/// Writes go to the primary, carry the configured write concern and are never
/// retried. Write errors and write concern errors in a reply surface as
/// [`CommandError`].
use super::database::{Database, DEFAULT_STATS_SCALE};
use crate::config::WriteConcern;
use crate::core::Preference;
use crate::cursor::CursorSession;
use crate::dispatch::{command_error, Operation, Reply};
use crate::error::{CommandError, Result};
use crate::utils::get_int;
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Server code for a collection that does not exist
const NAMESPACE_NOT_FOUND: i32 = 26;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub skip: Option<u64>,
    /// A negative limit returns at most `|limit|` documents in one batch
    pub limit: Option<i64>,
    pub batch_size: Option<u32>,
    pub max_time: Option<Duration>,
    /// Overrides the collection's read preference
    pub read_preference: Option<Preference>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub upsert: bool,
}

/// What `find_one_and_modify` does to the matched document
#[derive(Debug, Clone, PartialEq)]
pub enum Modification {
    Update(Document),
    Remove,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOneAndModifyOptions {
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    /// Return the document after the update instead of before
    pub return_new: bool,
    pub upsert: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
    pub inserted_id: Bson,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertManyResult {
    /// `_id` of each inserted document by input position
    pub inserted_ids: BTreeMap<usize, Bson>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexOptions {
    /// Defaults to the key fields and directions joined by `_`
    pub name: Option<String>,
    pub unique: bool,
    pub sparse: bool,
    pub expire_after: Option<Duration>,
}

/// Index addressed by name or by its key document
#[derive(Debug, Clone, PartialEq)]
pub enum IndexTarget {
    Name(String),
    Keys(Document),
}

impl From<&str> for IndexTarget {
    fn from(name: &str) -> Self {
        IndexTarget::Name(name.to_string())
    }
}

impl From<Document> for IndexTarget {
    fn from(keys: Document) -> Self {
        IndexTarget::Keys(keys)
    }
}

/// One write inside a `bulk_write`
#[derive(Debug, Clone, PartialEq)]
pub enum WriteModel {
    InsertOne { document: Document },
    UpdateOne { filter: Document, update: Document, upsert: bool },
    UpdateMany { filter: Document, update: Document, upsert: bool },
    ReplaceOne { filter: Document, replacement: Document, upsert: bool },
    DeleteOne { filter: Document },
    DeleteMany { filter: Document },
}

impl WriteModel {
    fn command_name(&self) -> &'static str {
        match self {
            WriteModel::InsertOne { .. } => "insert",
            WriteModel::UpdateOne { .. } | WriteModel::UpdateMany { .. } | WriteModel::ReplaceOne { .. } => "update",
            WriteModel::DeleteOne { .. } | WriteModel::DeleteMany { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkWriteOptions {
    /// Stop at the first failing batch
    pub ordered: bool,
}

impl Default for BulkWriteOptions {
    fn default() -> Self {
        Self { ordered: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteResult {
    pub inserted_count: u64,
    pub matched_count: u64,
    pub modified_count: u64,
    pub deleted_count: u64,
    /// `_id` of each upserted document by input position
    pub upserted_ids: BTreeMap<usize, Bson>,
}

/// Handle on one collection
#[derive(Clone)]
pub struct Collection {
    database: Database,
    name: String,
    read_preference: Preference,
    write_concern: WriteConcern,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("namespace", &self.namespace())
            .finish_non_exhaustive()
    }
}

impl Collection {
    pub(crate) fn new(database: Database, name: &str, read_preference: Preference, write_concern: WriteConcern) -> Self {
        Self {
            database,
            name: name.to_string(),
            read_preference,
            write_concern,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database.name(), self.name)
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn with_read_preference(mut self, preference: Preference) -> Self {
        self.read_preference = preference;
        self
    }

    pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = write_concern;
        self
    }

    async fn read(&self, command: Document, preference: Preference) -> Result<Reply> {
        self.database
            .client()
            .dispatcher()
            .execute(Operation::read(self.database.name(), command, preference))
            .await
    }

    /// Send a write with the write concern attached and check the reply for
    /// write errors
    async fn write(&self, mut command: Document) -> Result<Reply> {
        if !self.write_concern.is_empty() {
            command.insert("writeConcern", self.write_concern.to_document());
        }
        let reply = self
            .database
            .client()
            .dispatcher()
            .execute(Operation::write(self.database.name(), command))
            .await?;
        if let Some(err) = write_error(&reply.document) {
            debug!("Write to {} failed: {}", self.namespace(), err);
            return Err(err.into());
        }
        Ok(reply)
    }

    fn cursor(&self, reply: Reply, preference: Preference, batch_size: Option<u32>) -> Result<CursorSession> {
        CursorSession::from_reply(
            self.database.client().dispatcher().clone(),
            self.database.name(),
            reply,
            preference,
            batch_size,
        )
    }

    pub async fn find(&self, filter: Document, options: FindOptions) -> Result<CursorSession> {
        let mut command = doc! { "find": self.name.as_str(), "filter": filter };
        if let Some(projection) = options.projection {
            command.insert("projection", projection);
        }
        if let Some(sort) = options.sort {
            command.insert("sort", sort);
        }
        if let Some(skip) = options.skip {
            command.insert("skip", skip as i64);
        }
        match options.limit {
            Some(limit) if limit < 0 => {
                command.insert("limit", limit.checked_neg().unwrap_or(i64::MAX));
                command.insert("singleBatch", true);
            }
            Some(limit) if limit > 0 => {
                command.insert("limit", limit);
            }
            _ => {}
        }
        if let Some(batch_size) = options.batch_size {
            command.insert("batchSize", batch_size as i64);
        }
        if let Some(max_time) = options.max_time {
            command.insert("maxTimeMS", max_time.as_millis() as i64);
        }

        let preference = options.read_preference.unwrap_or_else(|| self.read_preference.clone());
        let reply = self.read(command, preference.clone()).await?;
        self.cursor(reply, preference, options.batch_size)
    }

    pub async fn find_one(&self, filter: Document) -> Result<Option<Document>> {
        let options = FindOptions {
            limit: Some(-1),
            ..Default::default()
        };
        let mut cursor = self.find(filter, options).await?;
        let document = if cursor.has_next().await? {
            Some(cursor.next().await?)
        } else {
            None
        };
        cursor.close().await;
        Ok(document)
    }

    /// Insert one document, generating an ObjectId `_id` when it has none
    pub async fn insert_one(&self, document: Document) -> Result<InsertOneResult> {
        let (inserted_id, document) = with_id(document);
        self.write(doc! { "insert": self.name.as_str(), "documents": [document] })
            .await?;
        Ok(InsertOneResult { inserted_id })
    }

    /// Ordered insert of every document; stops at the first write error
    pub async fn insert_many<I>(&self, documents: I) -> Result<InsertManyResult>
    where
        I: IntoIterator<Item = Document>,
    {
        let mut inserted_ids = BTreeMap::new();
        let mut batch = Vec::new();
        for (index, document) in documents.into_iter().enumerate() {
            let (id, document) = with_id(document);
            inserted_ids.insert(index, id);
            batch.push(Bson::Document(document));
        }
        if batch.is_empty() {
            return Ok(InsertManyResult::default());
        }

        self.write(doc! { "insert": self.name.as_str(), "documents": batch, "ordered": true })
            .await?;
        Ok(InsertManyResult { inserted_ids })
    }

    async fn update(&self, filter: Document, update: Document, multi: bool, options: UpdateOptions) -> Result<UpdateResult> {
        let statement = doc! { "q": filter, "u": update, "multi": multi, "upsert": options.upsert };
        let reply = self
            .write(doc! { "update": self.name.as_str(), "updates": [statement] })
            .await?;

        let n = get_int(&reply.document, "n").unwrap_or(0).max(0) as u64;
        let upserted_id = reply
            .document
            .get_array("upserted")
            .ok()
            .and_then(|upserted| upserted.first())
            .and_then(Bson::as_document)
            .and_then(|entry| entry.get("_id").cloned());
        let matched_count = if upserted_id.is_some() { n.saturating_sub(1) } else { n };
        Ok(UpdateResult {
            matched_count,
            modified_count: get_int(&reply.document, "nModified").unwrap_or(0).max(0) as u64,
            upserted_id,
        })
    }

    pub async fn update_one(&self, filter: Document, update: Document, options: UpdateOptions) -> Result<UpdateResult> {
        self.update(filter, update, false, options).await
    }

    pub async fn update_many(&self, filter: Document, update: Document, options: UpdateOptions) -> Result<UpdateResult> {
        self.update(filter, update, true, options).await
    }

    async fn delete(&self, filter: Document, limit: i32) -> Result<DeleteResult> {
        let reply = self
            .write(doc! { "delete": self.name.as_str(), "deletes": [{ "q": filter, "limit": limit }] })
            .await?;
        Ok(DeleteResult {
            deleted_count: get_int(&reply.document, "n").unwrap_or(0).max(0) as u64,
        })
    }

    pub async fn delete_one(&self, filter: Document) -> Result<DeleteResult> {
        self.delete(filter, 1).await
    }

    pub async fn delete_many(&self, filter: Document) -> Result<DeleteResult> {
        self.delete(filter, 0).await
    }

    /// Count matching documents with a `$match`/`$group` aggregation
    pub async fn count_documents(&self, filter: Document) -> Result<u64> {
        let command = doc! {
            "aggregate": self.name.as_str(),
            "pipeline": [
                { "$match": filter },
                { "$group": { "_id": 1, "n": { "$sum": 1 } } },
            ],
            "cursor": {},
        };
        let reply = self.read(command, self.read_preference.clone()).await?;
        let count = reply
            .document
            .get_document("cursor")
            .ok()
            .and_then(|cursor| cursor.get_array("firstBatch").ok())
            .and_then(|batch| batch.first())
            .and_then(Bson::as_document)
            .and_then(|group| get_int(group, "n"))
            .unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    pub async fn distinct(&self, field: &str, filter: Document) -> Result<Vec<Bson>> {
        let command = doc! { "distinct": self.name.as_str(), "key": field, "query": filter };
        let reply = self.read(command, self.read_preference.clone()).await?;
        Ok(reply
            .document
            .get_array("values")
            .map(|values| values.to_vec())
            .unwrap_or_default())
    }

    /// Run a pipeline. A pipeline ending in `$out` or `$merge` writes, so it
    /// runs on the primary and is not retried.
    pub async fn aggregate(&self, pipeline: Vec<Document>) -> Result<CursorSession> {
        let writes = pipeline
            .last()
            .and_then(|stage| stage.keys().next())
            .map(|stage| stage == "$out" || stage == "$merge")
            .unwrap_or(false);
        let command = doc! { "aggregate": self.name.as_str(), "pipeline": pipeline, "cursor": {} };

        if writes {
            let reply = self.write(command).await?;
            self.cursor(reply, Preference::primary(), None)
        } else {
            let preference = self.read_preference.clone();
            let reply = self.read(command, preference.clone()).await?;
            self.cursor(reply, preference, None)
        }
    }

    /// Atomically update or remove one document and return it
    pub async fn find_one_and_modify(
        &self,
        filter: Document,
        modification: Modification,
        options: FindOneAndModifyOptions,
    ) -> Result<Option<Document>> {
        let mut command = doc! { "findAndModify": self.name.as_str(), "query": filter };
        match modification {
            Modification::Update(update) => {
                command.insert("update", update);
                command.insert("new", options.return_new);
                command.insert("upsert", options.upsert);
            }
            Modification::Remove => {
                command.insert("remove", true);
            }
        }
        if let Some(sort) = options.sort {
            command.insert("sort", sort);
        }
        if let Some(projection) = options.projection {
            command.insert("fields", projection);
        }

        let reply = self.write(command).await?;
        match reply.document.get("value") {
            Some(Bson::Document(document)) => Ok(Some(document.clone())),
            _ => Ok(None),
        }
    }

    /// Replace the first document matching `filter` with `replacement`
    pub async fn replace_one(&self, filter: Document, replacement: Document, options: UpdateOptions) -> Result<UpdateResult> {
        self.update(filter, replacement, false, options).await
    }

    pub async fn find_one_and_delete(
        &self,
        filter: Document,
        options: FindOneAndModifyOptions,
    ) -> Result<Option<Document>> {
        self.find_one_and_modify(filter, Modification::Remove, options).await
    }

    pub async fn find_one_and_replace(
        &self,
        filter: Document,
        replacement: Document,
        options: FindOneAndModifyOptions,
    ) -> Result<Option<Document>> {
        self.find_one_and_modify(filter, Modification::Update(replacement), options)
            .await
    }

    /// Run a sequence of writes. Consecutive models of the same kind share
    /// one command. Ordered runs stop at the first failing command; unordered
    /// runs send every command and report the first failure at the end.
    pub async fn bulk_write(&self, models: Vec<WriteModel>, options: BulkWriteOptions) -> Result<BulkWriteResult> {
        let mut result = BulkWriteResult::default();
        let mut first_error = None;

        let mut batches: Vec<(&'static str, Vec<(usize, WriteModel)>)> = Vec::new();
        for (index, model) in models.into_iter().enumerate() {
            let name = model.command_name();
            let extends_last = matches!(batches.last(), Some((last, _)) if *last == name);
            if extends_last {
                if let Some((_, batch)) = batches.last_mut() {
                    batch.push((index, model));
                }
            } else {
                batches.push((name, vec![(index, model)]));
            }
        }

        for (name, batch) in batches {
            let positions: Vec<usize> = batch.iter().map(|(index, _)| *index).collect();
            let statements: Vec<Bson> = batch
                .into_iter()
                .map(|(_, model)| Bson::Document(write_statement(model)))
                .collect();
            let field = match name {
                "insert" => "documents",
                "update" => "updates",
                _ => "deletes",
            };
            let mut command = Document::new();
            command.insert(name, self.name.as_str());
            command.insert(field, statements);
            command.insert("ordered", options.ordered);

            let reply = match self.write(command).await {
                Ok(reply) => reply,
                Err(err) if options.ordered => return Err(err),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    continue;
                }
            };
            let n = get_int(&reply.document, "n").unwrap_or(0).max(0) as u64;
            match name {
                "insert" => result.inserted_count += n,
                "update" => {
                    let upserted = reply.document.get_array("upserted").map(|u| u.to_vec()).unwrap_or_default();
                    for entry in upserted.iter().filter_map(Bson::as_document) {
                        let position = get_int(entry, "index")
                            .and_then(|i| usize::try_from(i).ok())
                            .and_then(|i| positions.get(i).copied());
                        if let (Some(position), Some(id)) = (position, entry.get("_id")) {
                            result.upserted_ids.insert(position, id.clone());
                        }
                    }
                    result.matched_count += n.saturating_sub(upserted.len() as u64);
                    result.modified_count += get_int(&reply.document, "nModified").unwrap_or(0).max(0) as u64;
                }
                _ => result.deleted_count += n,
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    /// Build an index and return its name
    pub async fn create_index(&self, keys: Document, options: IndexOptions) -> Result<String> {
        let name = options.name.unwrap_or_else(|| index_name(&keys));
        let mut index = doc! { "key": keys, "name": name.as_str() };
        if options.unique {
            index.insert("unique", true);
        }
        if options.sparse {
            index.insert("sparse", true);
        }
        if let Some(expire_after) = options.expire_after {
            index.insert("expireAfterSeconds", expire_after.as_secs() as i64);
        }
        self.write(doc! { "createIndexes": self.name.as_str(), "indexes": [index] })
            .await?;
        debug!("Created index {} on {}", name, self.namespace());
        Ok(name)
    }

    pub async fn drop_index<T: Into<IndexTarget>>(&self, index: T) -> Result<()> {
        let index = match index.into() {
            IndexTarget::Name(name) => Bson::String(name),
            IndexTarget::Keys(keys) => Bson::Document(keys),
        };
        self.write(doc! { "dropIndexes": self.name.as_str(), "index": index })
            .await?;
        Ok(())
    }

    /// Drop every index except the one on `_id`
    pub async fn drop_indexes(&self) -> Result<()> {
        self.drop_index("*").await
    }

    /// Index descriptions as a cursor
    pub async fn indexes(&self) -> Result<CursorSession> {
        let command = doc! { "listIndexes": self.name.as_str(), "cursor": {} };
        let reply = self.read(command, self.read_preference.clone()).await?;
        self.cursor(reply, self.read_preference.clone(), None)
    }

    /// Rename within the same database and return a handle on the new name
    pub async fn rename(&self, new_name: &str, drop_target: bool) -> Result<Collection> {
        let target = format!("{}.{}", self.database.name(), new_name);
        let mut command = doc! {
            "renameCollection": self.namespace(),
            "to": target.as_str(),
            "dropTarget": drop_target,
        };
        if !self.write_concern.is_empty() {
            command.insert("writeConcern", self.write_concern.to_document());
        }
        self.database.client().database("admin").run_command(command).await?;
        debug!("Renamed {} to {}", self.namespace(), target);
        Ok(Collection::new(
            self.database.clone(),
            new_name,
            self.read_preference.clone(),
            self.write_concern.clone(),
        ))
    }

    /// `collStats` with sizes divided by `scale` (default 1024)
    pub async fn stats(&self, scale: Option<i32>) -> Result<Document> {
        let command = doc! {
            "collStats": self.name.as_str(),
            "scale": scale.unwrap_or(DEFAULT_STATS_SCALE),
        };
        Ok(self.read(command, self.read_preference.clone()).await?.document)
    }

    /// Drop the collection. Dropping a missing collection succeeds.
    pub async fn drop(&self) -> Result<()> {
        match self.write(doc! { "drop": self.name.as_str() }).await {
            Ok(_) => Ok(()),
            Err(err) if err.code() == Some(NAMESPACE_NOT_FOUND) => {
                debug!("Collection {} did not exist", self.namespace());
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Default index name: `{"a": 1, "b": -1}` becomes `a_1_b_-1`
fn index_name(keys: &Document) -> String {
    keys.iter()
        .map(|(field, direction)| {
            let direction = match direction {
                Bson::Int32(n) => n.to_string(),
                Bson::Int64(n) => n.to_string(),
                Bson::Double(n) => (*n as i64).to_string(),
                Bson::String(kind) => kind.clone(),
                other => other.to_string(),
            };
            format!("{field}_{direction}")
        })
        .collect::<Vec<_>>()
        .join("_")
}

fn write_statement(model: WriteModel) -> Document {
    match model {
        WriteModel::InsertOne { document } => with_id(document).1,
        WriteModel::UpdateOne { filter, update, upsert } => {
            doc! { "q": filter, "u": update, "multi": false, "upsert": upsert }
        }
        WriteModel::UpdateMany { filter, update, upsert } => {
            doc! { "q": filter, "u": update, "multi": true, "upsert": upsert }
        }
        WriteModel::ReplaceOne { filter, replacement, upsert } => {
            doc! { "q": filter, "u": replacement, "multi": false, "upsert": upsert }
        }
        WriteModel::DeleteOne { filter } => doc! { "q": filter, "limit": 1 },
        WriteModel::DeleteMany { filter } => doc! { "q": filter, "limit": 0 },
    }
}

/// Return the document's `_id`, adding a fresh ObjectId first when missing
fn with_id(document: Document) -> (Bson, Document) {
    if let Some(id) = document.get("_id") {
        return (id.clone(), document);
    }
    let id = Bson::ObjectId(ObjectId::new());
    let mut with_id = doc! { "_id": id.clone() };
    for (key, value) in document {
        with_id.insert(key, value);
    }
    (id, with_id)
}

/// First write error, then the write concern error, of an `ok: 1` reply.
/// Replies with a falsy `ok` are handled by the dispatcher.
fn write_error(reply: &Document) -> Option<CommandError> {
    let from = |entry: &Document| {
        CommandError::new(
            get_int(entry, "code").unwrap_or(0) as i32,
            entry.get_str("codeName").ok().map(str::to_string),
            entry.get_str("errmsg").unwrap_or("write failed"),
        )
    };

    if let Some(first) = reply
        .get_array("writeErrors")
        .ok()
        .and_then(|errors| errors.first())
        .and_then(Bson::as_document)
    {
        return Some(from(first));
    }
    if let Ok(concern) = reply.get_document("writeConcernError") {
        return Some(from(concern));
    }
    command_error(reply)
}
