//! Remote Elasticsearch-compatible index reached over HTTP.

use super::{
    detail_key, info_key, BookDetail, BookDetailHit, BookInfo, IndexBackend, Result,
    SearchResults, MAX_HITS,
};
use crate::error::IndexError;
use crate::models::{BookId, OwnerId};
use log::{debug, info, warn};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

const INFO_COLLECTION: &str = "book_info";
const DETAIL_COLLECTION: &str = "book_detail";
const ATTACHMENT_PIPELINE: &str = "attachment";
const CONTENT_FIELD: &str = "attachment.content";

#[derive(Debug, Deserialize)]
struct SearchResponse<T> {
    hits: HitList<T>,
}

#[derive(Debug, Deserialize)]
struct HitList<T> {
    #[serde(default = "Vec::new")]
    hits: Vec<Hit<T>>,
}

#[derive(Debug, Deserialize)]
struct Hit<T> {
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(rename = "_source")]
    source: T,
    #[serde(default)]
    highlight: HashMap<String, Vec<String>>,
}

/// Restricts `query` to one owner's documents with a non-scoring filter.
fn scoped(query: Value, owner_id: Option<OwnerId>) -> Value {
    match owner_id {
        Some(owner_id) => json!({
            "bool": {
                "must": query,
                "filter": { "term": { "owner_id": owner_id } }
            }
        }),
        None => query,
    }
}

/// Recovers `(owner, book)` from a `{owner}_{book}[_{page}]` document id.
fn ids_from_key(key: &str) -> Option<(OwnerId, BookId)> {
    let mut parts = key.split('_');
    let owner = parts.next()?.parse().ok()?;
    let book = parts.next()?.parse().ok()?;
    Some((owner, book))
}

pub struct RemoteIndex {
    client: Client,
    base_url: String,
    index: String,
}

impl RemoteIndex {
    pub fn new(base_url: &str, index: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.to_string(),
        })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.index, collection)
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}", self.collection_url(collection), id)
    }

    /// Sends `request`; a 404 is `Ok(None)` when `allow_missing` is set.
    /// Bodies go through `RequestBuilder::json`, which sets the content type.
    fn send(&self, request: RequestBuilder, url: &str, allow_missing: bool) -> Result<Option<Value>> {
        let response = request.send()?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND && allow_missing {
            debug!("{} not found", url);
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(IndexError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }
        let body = response.text()?;
        if body.trim().is_empty() {
            return Ok(Some(Value::Null));
        }
        Ok(Some(serde_json::from_str(&body)?))
    }

    fn search<T>(&self, collection: &str, body: &Value) -> Result<Vec<Hit<T>>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/_search", self.collection_url(collection));
        let value = self
            .send(self.client.get(&url).json(body), &url, true)?
            .unwrap_or(Value::Null);
        if value.is_null() {
            return Ok(Vec::new());
        }
        let response: SearchResponse<T> = serde_json::from_value(value)?;
        Ok(response.hits.hits)
    }

    /// Installs the ingest pipeline that turns base64 `thedata` into
    /// searchable `attachment.content`.
    pub fn ensure_attachment_pipeline(&self) -> Result<()> {
        let url = format!("{}/_ingest/pipeline/{}", self.base_url, ATTACHMENT_PIPELINE);
        let body = json!({
            "description": "Extract attachment information",
            "processors": [
                { "attachment": { "field": "thedata" } }
            ]
        });
        self.send(self.client.put(&url).json(&body), &url, false)?;
        info!("installed ingest pipeline {}", ATTACHMENT_PIPELINE);
        Ok(())
    }

    fn partial_update(&self, collection: &str, id: &str, doc: &BookInfo) -> Result<()> {
        let url = format!("{}/_update", self.document_url(collection, id));
        let body = json!({
            "doc": {
                "title": doc.title,
                "author": doc.author,
                "cover": doc.cover,
            }
        });
        self.send(self.client.post(&url).json(&body), &url, collection == DETAIL_COLLECTION)?;
        Ok(())
    }
}

impl IndexBackend for RemoteIndex {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn supports_detail(&self) -> bool {
        true
    }

    fn index_info(&self, doc: &BookInfo) -> Result<()> {
        let url = self.document_url(INFO_COLLECTION, &doc.key());
        self.send(self.client.put(&url).json(doc), &url, false)?;
        Ok(())
    }

    fn index_detail(&self, doc: &BookDetail) -> Result<()> {
        let url = format!(
            "{}?pipeline={}",
            self.document_url(DETAIL_COLLECTION, &doc.key()),
            ATTACHMENT_PIPELINE
        );
        self.send(self.client.put(&url).json(doc), &url, false)?;
        Ok(())
    }

    fn update_info(&self, doc: &BookInfo, detail_pages: i64) -> Result<()> {
        self.partial_update(INFO_COLLECTION, &doc.key(), doc)?;
        for page in 0..=detail_pages {
            let id = detail_key(doc.owner_id, doc.book_id, page);
            if let Err(err) = self.partial_update(DETAIL_COLLECTION, &id, doc) {
                warn!("failed to update {}: {}", id, err);
            }
        }
        Ok(())
    }

    fn delete_info(&self, owner_id: OwnerId, book_id: BookId) -> Result<()> {
        let url = self.document_url(INFO_COLLECTION, &info_key(owner_id, book_id));
        self.send(self.client.delete(&url), &url, true)?;
        Ok(())
    }

    fn delete_detail(&self, owner_id: OwnerId, book_id: BookId, page: i64) -> Result<()> {
        let url = self.document_url(DETAIL_COLLECTION, &detail_key(owner_id, book_id, page));
        self.send(self.client.delete(&url), &url, true)?;
        Ok(())
    }

    fn query(&self, term: &str, owner_id: Option<OwnerId>) -> Result<SearchResults> {
        let info_body = json!({
            "size": MAX_HITS,
            "_source": ["owner_id", "book_id", "title", "author", "url", "cover"],
            "query": scoped(
                json!({ "multi_match": { "query": term, "fields": ["title", "author"] } }),
                owner_id,
            )
        });
        let book_info = self
            .search::<BookInfo>(INFO_COLLECTION, &info_body)?
            .into_iter()
            .map(|hit| {
                let mut info = hit.source;
                if let Some((owner_id, book_id)) = ids_from_key(&hit.id) {
                    info.owner_id = owner_id;
                    info.book_id = book_id;
                }
                info
            })
            .collect();

        let detail_body = json!({
            "size": MAX_HITS,
            "_source": ["owner_id", "book_id", "title", "author", "url", "se_url", "cover", "page", "format"],
            "query": scoped(json!({ "match_phrase": { CONTENT_FIELD: term } }), owner_id),
            "highlight": {
                "fields": {
                    CONTENT_FIELD: {
                        "fragment_size": 150,
                        "number_of_fragments": 3,
                        "no_match_size": 150
                    }
                }
            }
        });
        let book_detail = self
            .search::<BookDetailHit>(DETAIL_COLLECTION, &detail_body)?
            .into_iter()
            .map(|mut hit| {
                let mut detail = hit.source;
                if let Some((owner_id, book_id)) = ids_from_key(&hit.id) {
                    detail.owner_id = owner_id;
                    detail.book_id = book_id;
                }
                detail.highlights = hit.highlight.remove(CONTENT_FIELD).unwrap_or_default();
                detail
            })
            .collect();

        Ok(SearchResults {
            book_info,
            book_detail,
        })
    }
}
