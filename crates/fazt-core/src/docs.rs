//! The document capability.
//!
//! Documents are JSON objects in named collections, keyed
//! `(scope, collection, id)`. Queries support field equality and the
//! comparison operators `$gt`/`$gte`/`$lt`/`$lte` (numbers compare
//! numerically, strings lexicographically). Mutations are shallow field
//! merges plus `$inc`, which adjusts a numeric field atomically — the whole
//! read-modify-write runs as one write-queue job on the single worker, so
//! concurrent increments never lose updates.
//!
//! Documents carrying a string `session_id` field are additionally indexed
//! under a dedicated key prefix, which turns the common "all docs for this
//! session" query into a prefix list instead of a collection scan.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::{Map, Value};

use fazt_storage::StorageBackend;

use crate::error::DocError;
use crate::ids;
use crate::queue::WriteQueue;
use crate::scope::Scope;

/// The operators the query language implements.
const COMPARISON_OPS: &[&str] = &["$gt", "$gte", "$lt", "$lte"];

/// The indexed field.
const SESSION_FIELD: &str = "session_id";

/// App- and user-scoped document storage.
pub struct DocStore {
    storage: Arc<dyn StorageBackend>,
    queue: Arc<WriteQueue>,
}

impl DocStore {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, queue: Arc<WriteQueue>) -> Self {
        Self { storage, queue }
    }

    /// Insert a document, generating an `id` when absent. Returns the
    /// stored document.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::BadDocument`] for non-object documents or bad ids.
    pub async fn insert(
        &self,
        scope: &Scope,
        collection: &str,
        doc: Value,
    ) -> Result<Value, DocError> {
        validate_collection(collection)?;
        let Value::Object(mut doc) = doc else {
            return Err(DocError::BadDocument {
                reason: "document must be a JSON object".to_owned(),
            });
        };

        let id = match doc.get("id") {
            None => {
                let id = ids::new_id();
                doc.insert("id".to_owned(), Value::String(id.clone()));
                id
            }
            Some(Value::String(id)) if is_valid_id(id) => id.clone(),
            Some(_) => {
                return Err(DocError::BadDocument {
                    reason: "id must be a string of letters, digits, '-' or '_'".to_owned(),
                });
            }
        };

        let key = format!("{}{id}", scope.doc_prefix(collection));
        let bytes = serde_json::to_vec(&doc).map_err(|e| DocError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        let mut batch: Vec<(String, Option<Vec<u8>>)> = vec![(key, Some(bytes))];
        if let Some(sid) = session_id_of(&doc) {
            let idx = format!("{}{sid}/{id}", scope.doc_index_prefix(collection));
            batch.push((idx, Some(id.clone().into_bytes())));
        }

        let storage = Arc::clone(&self.storage);
        self.queue
            .submit(move || async move { storage.put_batch(batch).await })
            .await??;

        Ok(Value::Object(doc))
    }

    /// All documents matching the query, in id order.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::BadOperator`] / [`DocError::BadQuery`] for
    /// malformed queries.
    pub async fn find(
        &self,
        scope: &Scope,
        collection: &str,
        query: &Value,
    ) -> Result<Vec<Value>, DocError> {
        validate_collection(collection)?;
        let query = as_query(query)?;
        let matched =
            find_matching(&self.storage, scope, collection, &query).await?;
        Ok(matched.into_iter().map(|(_, doc)| Value::Object(doc)).collect())
    }

    /// The first matching document, if any.
    ///
    /// # Errors
    ///
    /// Same as [`find`](DocStore::find).
    pub async fn find_one(
        &self,
        scope: &Scope,
        collection: &str,
        query: &Value,
    ) -> Result<Option<Value>, DocError> {
        Ok(self.find(scope, collection, query).await?.into_iter().next())
    }

    /// Apply a mutation to every matching document. Returns the number of
    /// documents affected.
    ///
    /// The scan, mutation, and write all happen inside a single queue job;
    /// with one write worker this makes `$inc` atomic across concurrent
    /// callers.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::BadOperator`], [`DocError::BadQuery`],
    /// [`DocError::BadDocument`], or [`DocError::NotNumeric`].
    pub async fn update(
        &self,
        scope: &Scope,
        collection: &str,
        query: &Value,
        mutation: &Value,
    ) -> Result<u64, DocError> {
        validate_collection(collection)?;
        let query = as_query(query)?;
        let mutation = as_mutation(mutation)?;

        let storage = Arc::clone(&self.storage);
        let scope = scope.clone();
        let collection = collection.to_owned();
        self.queue
            .submit(move || async move {
                let matched = find_matching(&storage, &scope, &collection, &query).await?;
                let mut batch: Vec<(String, Option<Vec<u8>>)> = Vec::new();
                let mut affected = 0u64;

                for (key, mut doc) in matched {
                    let old_sid = session_id_of(&doc);
                    apply_mutation(&mut doc, &mutation)?;
                    let new_sid = session_id_of(&doc);

                    let id = doc
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned();
                    if old_sid != new_sid {
                        let idx_prefix = scope.doc_index_prefix(&collection);
                        if let Some(sid) = old_sid {
                            batch.push((format!("{idx_prefix}{sid}/{id}"), None));
                        }
                        if let Some(sid) = new_sid {
                            batch.push((
                                format!("{idx_prefix}{sid}/{id}"),
                                Some(id.clone().into_bytes()),
                            ));
                        }
                    }

                    let bytes = serde_json::to_vec(&doc).map_err(|e| DocError::Corrupt {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?;
                    batch.push((key, Some(bytes)));
                    affected += 1;
                }

                storage.put_batch(batch).await?;
                Ok::<u64, DocError>(affected)
            })
            .await?
    }

    /// Delete every matching document. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Same as [`find`](DocStore::find).
    pub async fn delete(
        &self,
        scope: &Scope,
        collection: &str,
        query: &Value,
    ) -> Result<u64, DocError> {
        validate_collection(collection)?;
        let query = as_query(query)?;

        let storage = Arc::clone(&self.storage);
        let scope = scope.clone();
        let collection = collection.to_owned();
        self.queue
            .submit(move || async move {
                let matched = find_matching(&storage, &scope, &collection, &query).await?;
                let mut batch: Vec<(String, Option<Vec<u8>>)> = Vec::new();
                let removed = matched.len() as u64;

                let idx_prefix = scope.doc_index_prefix(&collection);
                for (key, doc) in matched {
                    if let (Some(sid), Some(id)) =
                        (session_id_of(&doc), doc.get("id").and_then(Value::as_str))
                    {
                        batch.push((format!("{idx_prefix}{sid}/{id}"), None));
                    }
                    batch.push((key, None));
                }

                storage.put_batch(batch).await?;
                Ok::<u64, DocError>(removed)
            })
            .await?
    }
}

impl std::fmt::Debug for DocStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocStore").finish_non_exhaustive()
    }
}

// ── Query evaluation ─────────────────────────────────────────────────

fn validate_collection(collection: &str) -> Result<(), DocError> {
    let ok = !collection.is_empty()
        && collection.len() <= 64
        && collection
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(DocError::BadQuery {
            reason: format!("invalid collection name '{collection}'"),
        })
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Validate the query shape and return its map.
fn as_query(query: &Value) -> Result<Map<String, Value>, DocError> {
    let Value::Object(map) = query else {
        return Err(DocError::BadQuery {
            reason: "query must be a JSON object".to_owned(),
        });
    };
    for (field, cond) in map {
        if field.starts_with('$') {
            return Err(DocError::BadOperator { op: field.clone() });
        }
        if let Value::Object(ops) = cond {
            let has_op = ops.keys().any(|k| k.starts_with('$'));
            if has_op {
                for op in ops.keys() {
                    if !op.starts_with('$') {
                        return Err(DocError::BadQuery {
                            reason: format!(
                                "cannot mix operators and fields under '{field}'"
                            ),
                        });
                    }
                    if !COMPARISON_OPS.contains(&op.as_str()) {
                        return Err(DocError::BadOperator { op: op.clone() });
                    }
                }
            }
        }
    }
    Ok(map.clone())
}

/// Validate the mutation shape and return its map.
fn as_mutation(mutation: &Value) -> Result<Map<String, Value>, DocError> {
    let Value::Object(map) = mutation else {
        return Err(DocError::BadDocument {
            reason: "mutation must be a JSON object".to_owned(),
        });
    };
    for (field, value) in map {
        if field == "$inc" {
            let Value::Object(incs) = value else {
                return Err(DocError::BadDocument {
                    reason: "$inc operand must be an object of numeric deltas".to_owned(),
                });
            };
            for (target, delta) in incs {
                if !delta.is_number() {
                    return Err(DocError::BadDocument {
                        reason: format!("$inc delta for '{target}' must be a number"),
                    });
                }
            }
        } else if field.starts_with('$') {
            return Err(DocError::BadOperator { op: field.clone() });
        } else if field == "id" {
            return Err(DocError::BadDocument {
                reason: "id is immutable".to_owned(),
            });
        }
    }
    Ok(map.clone())
}

/// Fetch all documents in the collection matching the (validated) query.
///
/// A string-equality condition on `session_id` switches the scan to the
/// dedicated index; everything else walks the collection prefix.
async fn find_matching(
    storage: &Arc<dyn StorageBackend>,
    scope: &Scope,
    collection: &str,
    query: &Map<String, Value>,
) -> Result<Vec<(String, Map<String, Value>)>, DocError> {
    let doc_prefix = scope.doc_prefix(collection);

    let candidates: Vec<(String, Vec<u8>)> = match query.get(SESSION_FIELD) {
        Some(Value::String(sid)) => {
            let idx_prefix = format!("{}{sid}/", scope.doc_index_prefix(collection));
            let mut pairs = Vec::new();
            for idx_key in storage.list(&idx_prefix).await? {
                let Some(id) = idx_key.strip_prefix(&idx_prefix) else {
                    continue;
                };
                let doc_key = format!("{doc_prefix}{id}");
                if let Some(bytes) = storage.get(&doc_key).await? {
                    pairs.push((doc_key, bytes));
                }
            }
            pairs
        }
        _ => storage.scan(&doc_prefix).await?,
    };

    let mut matched = Vec::new();
    for (key, bytes) in candidates {
        let doc: Map<String, Value> =
            serde_json::from_slice(&bytes).map_err(|e| DocError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        if matches(&doc, query) {
            matched.push((key, doc));
        }
    }
    Ok(matched)
}

/// Does the document satisfy the (validated) query?
fn matches(doc: &Map<String, Value>, query: &Map<String, Value>) -> bool {
    query.iter().all(|(field, cond)| {
        let actual = doc.get(field);
        match cond {
            Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                ops.iter().all(|(op, operand)| {
                    let Some(actual) = actual else { return false };
                    let Some(ord) = compare(actual, operand) else {
                        return false;
                    };
                    match op.as_str() {
                        "$gt" => ord == Ordering::Greater,
                        "$gte" => ord != Ordering::Less,
                        "$lt" => ord == Ordering::Less,
                        "$lte" => ord != Ordering::Greater,
                        _ => false,
                    }
                })
            }
            literal => actual == Some(literal),
        }
    })
}

/// Ordering between two comparable values. Numbers compare numerically,
/// strings lexicographically; mixed or non-comparable types do not compare.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        _ => None,
    }
}

/// Apply a validated mutation in place.
fn apply_mutation(
    doc: &mut Map<String, Value>,
    mutation: &Map<String, Value>,
) -> Result<(), DocError> {
    for (field, value) in mutation {
        if field == "$inc" {
            let Value::Object(incs) = value else {
                continue;
            };
            for (target, delta) in incs {
                inc_field(doc, target, delta)?;
            }
        } else {
            doc.insert(field.clone(), value.clone());
        }
    }
    Ok(())
}

/// `$inc` one field: a missing field starts at zero; integer arithmetic is
/// preserved when both sides are integers.
fn inc_field(doc: &mut Map<String, Value>, field: &str, delta: &Value) -> Result<(), DocError> {
    let current = match doc.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => Some(n.clone()),
        Some(_) => {
            return Err(DocError::NotNumeric {
                field: field.to_owned(),
            });
        }
    };

    // Integer arithmetic when both sides are integers and the sum fits;
    // otherwise fall back to f64.
    let cur_int = current.as_ref().and_then(serde_json::Number::as_i64);
    let int_next = match (cur_int, delta.as_i64()) {
        (cur, Some(d)) if current.is_none() || cur.is_some() => {
            cur.unwrap_or(0).checked_add(d).map(Value::from)
        }
        _ => None,
    };

    let next = match int_next {
        Some(v) => v,
        None => {
            let cur = current
                .as_ref()
                .and_then(serde_json::Number::as_f64)
                .unwrap_or(0.0);
            let d = delta.as_f64().ok_or_else(|| DocError::BadDocument {
                reason: format!("$inc delta for '{field}' must be a number"),
            })?;
            serde_json::Number::from_f64(cur + d)
                .map(Value::Number)
                .ok_or_else(|| DocError::NotNumeric {
                    field: field.to_owned(),
                })?
        }
    };
    doc.insert(field.to_owned(), next);
    Ok(())
}

fn session_id_of(doc: &Map<String, Value>) -> Option<String> {
    match doc.get(SESSION_FIELD) {
        Some(Value::String(sid)) if !sid.is_empty() && is_valid_index_component(sid) => {
            Some(sid.clone())
        }
        _ => None,
    }
}

fn is_valid_index_component(s: &str) -> bool {
    s.len() <= 128
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use fazt_storage::MemoryBackend;
    use serde_json::json;

    fn store() -> DocStore {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(256);
        DocStore::new(storage, queue)
    }

    fn app() -> Scope {
        Scope::app("app1")
    }

    #[tokio::test]
    async fn insert_assigns_id_and_findable() {
        let ds = store();
        let stored = ds
            .insert(&app(), "notes", json!({"text": "hi"}))
            .await
            .unwrap();
        let id = stored.get("id").and_then(Value::as_str).unwrap().to_owned();

        let found = ds
            .find_one(&app(), "notes", &json!({"id": id}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, stored);
    }

    #[tokio::test]
    async fn insert_rejects_non_object() {
        let ds = store();
        let err = ds.insert(&app(), "notes", json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, DocError::BadDocument { .. }));
    }

    #[tokio::test]
    async fn equality_query_filters() {
        let ds = store();
        ds.insert(&app(), "cats", json!({"name": "X", "color": "black"}))
            .await
            .unwrap();
        ds.insert(&app(), "cats", json!({"name": "Y", "color": "white"}))
            .await
            .unwrap();

        let found = ds
            .find(&app(), "cats", &json!({"color": "black"}))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["name"], "X");
    }

    #[tokio::test]
    async fn range_query_is_inclusive_on_gte_lte() {
        let ds = store();
        for score in [1, 5, 10, 15] {
            ds.insert(&app(), "scores", json!({"score": score}))
                .await
                .unwrap();
        }

        let found = ds
            .find(&app(), "scores", &json!({"score": {"$gte": 5, "$lte": 10}}))
            .await
            .unwrap();
        let values: Vec<i64> = found
            .iter()
            .map(|d| d["score"].as_i64().unwrap())
            .collect();
        assert_eq!(values.len(), 2);
        assert!(values.contains(&5) && values.contains(&10));
    }

    #[tokio::test]
    async fn strict_bounds_exclude_endpoints() {
        let ds = store();
        for score in [1, 5, 10] {
            ds.insert(&app(), "scores", json!({"score": score}))
                .await
                .unwrap();
        }
        let found = ds
            .find(&app(), "scores", &json!({"score": {"$gt": 1, "$lt": 10}}))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["score"], 5);
    }

    #[tokio::test]
    async fn strings_compare_lexicographically() {
        let ds = store();
        for name in ["anna", "bert", "carl"] {
            ds.insert(&app(), "people", json!({"name": name}))
                .await
                .unwrap();
        }
        let found = ds
            .find(&app(), "people", &json!({"name": {"$gte": "b"}}))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn unknown_operator_is_an_error() {
        let ds = store();
        let err = ds
            .find(&app(), "cats", &json!({"name": {"$regex": "^X"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, DocError::BadOperator { op } if op == "$regex"));
    }

    #[tokio::test]
    async fn update_merges_fields_shallowly() {
        let ds = store();
        ds.insert(&app(), "cats", json!({"name": "X", "color": "black"}))
            .await
            .unwrap();

        let affected = ds
            .update(
                &app(),
                "cats",
                &json!({"name": "X"}),
                &json!({"color": "grey", "age": 3}),
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let doc = ds
            .find_one(&app(), "cats", &json!({"name": "X"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["color"], "grey");
        assert_eq!(doc["age"], 3);
    }

    #[tokio::test]
    async fn inc_creates_missing_field_at_zero() {
        let ds = store();
        ds.insert(&app(), "cats", json!({"name": "X"})).await.unwrap();

        ds.update(
            &app(),
            "cats",
            &json!({"name": "X"}),
            &json!({"$inc": {"count": 5}}),
        )
        .await
        .unwrap();

        let doc = ds
            .find_one(&app(), "cats", &json!({"name": "X"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["count"], 5);
    }

    #[tokio::test]
    async fn concurrent_incs_sum_without_lost_updates() {
        let ds = Arc::new(store());
        ds.insert(&app(), "cats", json!({"name": "X", "count": 0}))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let ds = Arc::clone(&ds);
            handles.push(tokio::spawn(async move {
                ds.update(
                    &Scope::app("app1"),
                    "cats",
                    &json!({"name": "X"}),
                    &json!({"$inc": {"count": 1}}),
                )
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let doc = ds
            .find_one(&app(), "cats", &json!({"name": "X"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["count"], 2);
    }

    #[tokio::test]
    async fn inc_on_non_numeric_field_fails() {
        let ds = store();
        ds.insert(&app(), "cats", json!({"name": "X"})).await.unwrap();
        let err = ds
            .update(
                &app(),
                "cats",
                &json!({"name": "X"}),
                &json!({"$inc": {"name": 1}}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DocError::NotNumeric { .. }));
    }

    #[tokio::test]
    async fn delete_removes_matching_docs() {
        let ds = store();
        ds.insert(&app(), "cats", json!({"name": "X"})).await.unwrap();
        ds.insert(&app(), "cats", json!({"name": "Y"})).await.unwrap();

        let removed = ds
            .delete(&app(), "cats", &json!({"name": "X"}))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(ds.find(&app(), "cats", &json!({})).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn session_scoped_docs_are_isolated() {
        let ds = store();
        ds.insert(
            &app(),
            "notes",
            json!({"session_id": "cedar-blue-river", "text": "hi"}),
        )
        .await
        .unwrap();
        ds.insert(
            &app(),
            "notes",
            json!({"session_id": "other-session-id", "text": "theirs"}),
        )
        .await
        .unwrap();

        let mine = ds
            .find(&app(), "notes", &json!({"session_id": "cedar-blue-river"}))
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0]["text"], "hi");
    }

    #[tokio::test]
    async fn session_index_follows_updates() {
        let ds = store();
        let doc = ds
            .insert(&app(), "notes", json!({"session_id": "s-one", "text": "hi"}))
            .await
            .unwrap();
        let id = doc["id"].as_str().unwrap().to_owned();

        ds.update(
            &app(),
            "notes",
            &json!({"id": id}),
            &json!({"session_id": "s-two"}),
        )
        .await
        .unwrap();

        assert!(ds
            .find(&app(), "notes", &json!({"session_id": "s-one"}))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            ds.find(&app(), "notes", &json!({"session_id": "s-two"}))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn user_scoped_docs_are_isolated() {
        let ds = store();
        let alice = Scope::user("app1", "alice");
        let bob = Scope::user("app1", "bob");

        ds.insert(&alice, "todos", json!({"task": "water plants"}))
            .await
            .unwrap();

        assert!(ds.find(&bob, "todos", &json!({})).await.unwrap().is_empty());
        assert_eq!(ds.find(&alice, "todos", &json!({})).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_may_affect_zero_documents() {
        let ds = store();
        let affected = ds
            .update(
                &app(),
                "cats",
                &json!({"name": "nobody"}),
                &json!({"$inc": {"count": 1}}),
            )
            .await
            .unwrap();
        assert_eq!(affected, 0);
    }
}
