use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::USER_AGENT;
use reqwest::{Client as HttpClient, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::chunking::{ChunkInfo, PlanSummary, PlanTotals};
use crate::model::{
    Author, ChannelInfo, ContentUnit, GroupKey, Layout, MediaDescriptor, NestedUnit, SortOrder,
    UnitId,
};
use crate::settings::PartialSettings;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5000/";

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

/// Plan parameters forwarded to the backend as query parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanQuery {
    pub items_per_chunk: usize,
    pub overflow_threshold: f64,
    pub sort_order: SortOrder,
}

impl PlanQuery {
    fn into_params(self) -> Vec<(String, String)> {
        vec![
            ("items_per_chunk".into(), self.items_per_chunk.to_string()),
            ("overflow_threshold".into(), self.overflow_threshold.to_string()),
            ("sort_order".into(), self.sort_order.as_str().into()),
        ]
    }
}

pub struct Client {
    http: HttpClient,
    user_agent: String,
    base_url: Url,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("backend client user agent required");
        }
        let mut base = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        // paths are joined relative to the base
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).with_context(|| format!("backend: parse base url {base}"))?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()?,
        };

        Ok(Client {
            http,
            user_agent: config.user_agent,
            base_url,
        })
    }

    pub async fn channel(&self, channel_id: &str) -> Result<ChannelInfo> {
        let path = format!("/api/v2/channels/{channel_id}");
        let wire: WireChannel = self.get_json(&path, &[]).await?;
        wire.try_into()
    }

    pub async fn chunk_plan(&self, channel_id: &str, query: PlanQuery) -> Result<PlanSummary> {
        let path = format!("/api/v2/channels/{channel_id}/chunks");
        let wire: WirePlan = self.get_json(&path, &query.into_params()).await?;
        Ok(wire.into_summary(query))
    }

    /// Posts of one chunk, or of the whole channel when `chunk` is `None`,
    /// in the nested shape with albums and comments embedded. The plan
    /// parameters are sent along so the backend partitions exactly like
    /// the plan endpoint did.
    pub async fn channel_posts(
        &self,
        channel_id: &str,
        chunk: Option<usize>,
        query: PlanQuery,
    ) -> Result<Vec<NestedUnit>> {
        let path = format!("/api/v2/channels/{channel_id}/posts");
        let mut params = query.into_params();
        params.push(("include_hidden".to_string(), "true".to_string()));
        if let Some(index) = chunk {
            params.push(("chunk".to_string(), index.to_string()));
        }
        let wire: WirePosts = self.get_json(&path, &params).await?;
        decode_units(wire.posts)
    }

    pub async fn hidden_state(&self, channel_id: &str, unit_id: UnitId) -> Result<bool> {
        let path = format!("/api/edits/{unit_id}/{channel_id}");
        let wire: WireEdits = self.get_json(&path, &[]).await?;
        Ok(wire.hidden())
    }

    pub async fn layout(&self, channel_id: &str, group: GroupKey) -> Result<Option<Layout>> {
        let path = format!("/api/layouts/{group}");
        let params = vec![("channel_id".to_string(), channel_id.to_string())];
        let resp = self.request(Method::GET, &path, &params, None).await;
        match resp {
            Ok(resp) => Ok(Some(resp.json().await.context("backend: decode layout")?)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn update_settings(
        &self,
        channel_id: &str,
        settings: &PartialSettings,
    ) -> Result<PartialSettings> {
        let path = format!("/api/v2/channels/{channel_id}/settings");
        let body = serde_json::json!({ "display": settings });
        let resp = self.request(Method::PUT, &path, &[], Some(body)).await?;
        let wire: WireSettingsResponse = resp.json().await.context("backend: decode settings")?;
        Ok(wire.settings.display.into_partial()?)
    }

    pub async fn set_hidden(&self, channel_id: &str, unit_id: UnitId, hidden: bool) -> Result<()> {
        let body = serde_json::json!({
            "telegram_id": unit_id,
            "channel_id": channel_id,
            "changes": { "hidden": hidden.to_string() },
        });
        self.request(Method::POST, "/api/edits", &[], Some(body))
            .await?;
        Ok(())
    }

    async fn get_json<T>(&self, path: &str, params: &[(String, String)]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let resp = self.request(Method::GET, path, params, None).await?;
        resp.json()
            .await
            .with_context(|| format!("backend: decode {path}"))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        body: Option<Value>,
    ) -> Result<Response> {
        let mut url = self.base_url.join(path.trim_start_matches('/'))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }

        let mut req = self.http.request(method, url);
        req = req.header(USER_AGENT, self.user_agent.clone());
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<WireError>(&body)
            .map(|err| err.error)
            .unwrap_or(body);
        match status {
            StatusCode::NOT_FOUND => Err(anyhow!(NotFound(message))),
            _ => Err(anyhow!("backend: api error {}: {}", status, message)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("backend: not found: {0}")]
pub struct NotFound(pub String);

fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<NotFound>().is_some()
}

/// Accepts RFC 3339 or a naive ISO timestamp, which is taken as UTC.
pub fn parse_date(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Ok(date.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .with_context(|| format!("backend: invalid date {raw:?}"))?;
    Ok(naive.and_utc())
}

fn decode_units(wire: Vec<WireUnit>) -> Result<Vec<NestedUnit>> {
    wire.into_iter().map(NestedUnit::try_from).collect()
}

#[derive(Debug, Clone, Deserialize)]
struct WireError {
    error: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct WireAuthor {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default)]
    link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireUnit {
    /// Message identity; the backend's own row `id` is not used.
    telegram_id: UnitId,
    channel_id: Value,
    date: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    media_url: Option<String>,
    #[serde(default)]
    thumb_url: Option<String>,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    author: Option<WireAuthor>,
    #[serde(default)]
    author_name: Option<String>,
    #[serde(default)]
    author_avatar: Option<String>,
    #[serde(default)]
    author_link: Option<String>,
    #[serde(default)]
    grouped_id: Option<GroupKey>,
    #[serde(default)]
    reply_to: Option<UnitId>,
    #[serde(default)]
    is_hidden: bool,
    #[serde(default)]
    layout: Option<Layout>,
    #[serde(default)]
    group_posts: Option<Vec<WireUnit>>,
    #[serde(default)]
    comments: Option<Vec<WireUnit>>,
}

/// Channel identities arrive as strings or as bare numbers.
fn channel_key(value: &Value) -> Result<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => bail!("backend: invalid channel id {other}"),
    }
}

impl WireUnit {
    fn into_unit(self) -> Result<(ContentUnit, Vec<WireUnit>, Vec<WireUnit>)> {
        let channel_id = channel_key(&self.channel_id)?;
        let date = parse_date(&self.date)?;
        let author = match self.author {
            Some(WireAuthor {
                name: Some(name),
                avatar,
                link,
            }) => Some(Author { name, avatar, link }),
            _ => self.author_name.map(|name| Author {
                name,
                avatar: self.author_avatar,
                link: self.author_link,
            }),
        };
        let media = match (self.media_type, self.media_url) {
            (None, None) => None,
            (kind, url) => Some(MediaDescriptor {
                kind: kind.unwrap_or_default(),
                mime: self.mime_type,
                url,
                thumb_url: self.thumb_url,
            }),
        };
        let unit = ContentUnit {
            id: self.telegram_id,
            channel_id,
            date,
            reply_to: self.reply_to,
            grouped_id: self.grouped_id,
            message: self.message,
            media,
            author,
            is_hidden: self.is_hidden,
            layout: self.layout.map(std::sync::Arc::new),
        };
        Ok((
            unit,
            self.group_posts.unwrap_or_default(),
            self.comments.unwrap_or_default(),
        ))
    }
}

impl TryFrom<WireUnit> for NestedUnit {
    type Error = anyhow::Error;

    fn try_from(wire: WireUnit) -> Result<Self> {
        let id = wire.telegram_id;
        let (unit, group_posts, comments) = wire
            .into_unit()
            .with_context(|| format!("backend: unit {id}"))?;
        let flat = |list: Vec<WireUnit>| -> Result<Vec<ContentUnit>> {
            list.into_iter()
                .map(|w| w.into_unit().map(|(unit, _, _)| unit))
                .collect()
        };
        Ok(NestedUnit {
            unit,
            group_posts: flat(group_posts)?,
            comments: flat(comments)?,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
struct WireDisplay {
    #[serde(default)]
    sort_order: Option<String>,
    #[serde(default)]
    items_per_chunk: Option<usize>,
    #[serde(default)]
    overflow_threshold: Option<f64>,
}

impl WireDisplay {
    fn into_partial(self) -> Result<PartialSettings> {
        let sort_order = self
            .sort_order
            .map(|raw| raw.parse::<SortOrder>().map_err(|err| anyhow!("backend: {err}")))
            .transpose()?;
        Ok(PartialSettings {
            sort_order,
            items_per_chunk: self.items_per_chunk.filter(|n| *n > 0),
            overflow_threshold: self
                .overflow_threshold
                .filter(|t| (0.0..1.0).contains(t)),
        })
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct WireSettings {
    #[serde(default)]
    display: WireDisplay,
}

#[derive(Debug, Clone, Deserialize)]
struct WireSettingsResponse {
    settings: WireSettings,
}

#[derive(Debug, Clone, Deserialize)]
struct WireChannel {
    id: Value,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    discussion_group_id: Option<Value>,
    #[serde(default)]
    settings: WireSettings,
}

impl TryFrom<WireChannel> for ChannelInfo {
    type Error = anyhow::Error;

    fn try_from(wire: WireChannel) -> Result<Self> {
        Ok(ChannelInfo {
            id: channel_key(&wire.id)?,
            name: wire.name,
            discussion_group_id: wire
                .discussion_group_id
                .filter(|v| !v.is_null())
                .map(|v| channel_key(&v))
                .transpose()?,
            settings: wire.settings.display.into_partial()?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WirePlan {
    #[serde(default)]
    chunks: Vec<WireChunk>,
    #[serde(default)]
    total_chunks: Option<usize>,
    #[serde(default)]
    total_posts: Option<usize>,
    #[serde(default)]
    total_comments: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireChunk {
    index: usize,
    #[serde(default)]
    posts_count: usize,
    #[serde(default)]
    comments_count: usize,
    #[serde(default)]
    total_weight: usize,
    #[serde(default)]
    date_from: Option<String>,
    #[serde(default)]
    date_to: Option<String>,
}

impl WirePlan {
    fn into_summary(self, query: PlanQuery) -> PlanSummary {
        let chunks: Vec<ChunkInfo> = self
            .chunks
            .into_iter()
            .map(|chunk| {
                // the backend reports newest first; keep min/max semantics
                let a = chunk.date_from.as_deref().and_then(|d| parse_date(d).ok());
                let b = chunk.date_to.as_deref().and_then(|d| parse_date(d).ok());
                let (date_from, date_to) = match (a, b) {
                    (Some(a), Some(b)) => (Some(a.min(b)), Some(a.max(b))),
                    other => other,
                };
                ChunkInfo {
                    index: chunk.index,
                    unit_count: chunk.posts_count + chunk.comments_count,
                    posts_count: chunk.posts_count,
                    comments_count: chunk.comments_count,
                    total_weight: chunk.total_weight,
                    date_from,
                    date_to,
                }
            })
            .collect();
        let totals = PlanTotals {
            total_chunks: self.total_chunks.unwrap_or(chunks.len()),
            total_posts: self
                .total_posts
                .unwrap_or_else(|| chunks.iter().map(|c| c.posts_count).sum()),
            total_comments: self
                .total_comments
                .unwrap_or_else(|| chunks.iter().map(|c| c.comments_count).sum()),
            total_units: chunks.iter().map(|c| c.unit_count).sum(),
        };
        PlanSummary {
            sort_order: query.sort_order,
            items_per_chunk: query.items_per_chunk,
            overflow_threshold: query.overflow_threshold,
            chunks,
            totals,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WirePosts {
    #[serde(default)]
    posts: Vec<WireUnit>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireEdits {
    #[serde(default)]
    edits: Vec<WireEdit>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireEdit {
    #[serde(default)]
    changes: serde_json::Map<String, Value>,
}

impl WireEdits {
    /// The latest edit that mentions `hidden` decides.
    fn hidden(&self) -> bool {
        self.edits
            .iter()
            .rev()
            .find_map(|edit| edit.changes.get("hidden"))
            .map(|value| match value {
                Value::Bool(b) => *b,
                Value::String(s) => s == "true",
                _ => false,
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::{flatten, group_by_parent};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answer one request with a canned response; the handle yields the
    /// request line that was received.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request)
                .lines()
                .next()
                .unwrap_or_default()
                .to_string()
        });
        (format!("http://{addr}"), handle)
    }

    fn local_client(base_url: String) -> Client {
        Client::new(ClientConfig {
            user_agent: "channel-pager-test".into(),
            base_url: Some(base_url),
            timeout: Some(Duration::from_secs(5)),
            http_client: Some(HttpClient::builder().no_proxy().build().unwrap()),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn missing_layout_reads_as_none() {
        let (base, server) = serve_once("404 Not Found", r#"{"error":"Layout not found"}"#).await;
        let layout = local_client(base).layout("chan", 77).await.unwrap();
        assert!(layout.is_none());
        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/layouts/77?channel_id=chan "), "{request}");
    }

    #[tokio::test]
    async fn stored_layout_is_decoded() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"total_width":800.0,"total_height":400.0,"image_count":2,"cells":[{"image_index":0,"x":0.0,"y":0.0,"width":400.0,"height":400.0}]}"#,
        )
        .await;
        let layout = local_client(base).layout("chan", 77).await.unwrap().unwrap();
        assert_eq!(layout.image_count, 2);
        assert_eq!(layout.cells.len(), 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn server_errors_are_not_treated_as_missing() {
        let (base, server) = serve_once("500 Internal Server Error", r#"{"error":"boom"}"#).await;
        let err = local_client(base).layout("chan", 77).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn chunk_posts_carry_the_plan_parameters() {
        let (base, server) = serve_once("200 OK", r#"{"posts":[]}"#).await;
        let query = PlanQuery {
            items_per_chunk: 10,
            overflow_threshold: 0.3,
            sort_order: SortOrder::Asc,
        };
        let posts = local_client(base)
            .channel_posts("chan", Some(2), query)
            .await
            .unwrap();
        assert!(posts.is_empty());

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/v2/channels/chan/posts?"), "{request}");
        for param in [
            "items_per_chunk=10",
            "overflow_threshold=0.3",
            "sort_order=asc",
            "include_hidden=true",
            "chunk=2",
        ] {
            assert!(request.contains(param), "{param} missing from {request}");
        }
    }

    #[test]
    fn message_identity_is_the_telegram_id() {
        let raw = serde_json::json!({
            "id": 1,
            "telegram_id": 500,
            "channel_id": "chan",
            "date": "2024-03-01T10:00:00",
            "comments": [
                { "id": 2, "telegram_id": 700, "channel_id": "chat", "date": "2024-03-01T11:00:00", "reply_to": 500 }
            ]
        });
        let wire: WireUnit = serde_json::from_value(raw).unwrap();
        let flat = flatten(vec![NestedUnit::try_from(wire).unwrap()]);

        let ids: Vec<UnitId> = flat.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![500, 700]);
        let threads = group_by_parent(&flat);
        assert_eq!(threads.groups.len(), 1);
        assert_eq!(threads.groups[0].parent, 500);
        assert_eq!(threads.groups[0].comments, vec![700]);
        assert!(threads.standalone.is_empty());
    }

    #[test]
    fn units_without_a_telegram_id_are_rejected() {
        let raw = serde_json::json!({ "id": 1, "channel_id": "chan", "date": "2024-03-01T10:00:00" });
        assert!(serde_json::from_value::<WireUnit>(raw).is_err());
    }

    #[test]
    fn rejects_empty_user_agent() {
        assert!(Client::new(ClientConfig::default()).is_err());
    }

    #[test]
    fn parses_both_date_shapes() {
        let a = parse_date("2024-03-01T10:00:00+00:00").unwrap();
        let b = parse_date("2024-03-01T10:00:00").unwrap();
        assert_eq!(a, b);
        assert!(parse_date("yesterday").is_err());
    }

    #[test]
    fn decodes_nested_v2_post() {
        let raw = serde_json::json!({
            "id": 1,
            "telegram_id": 10,
            "channel_id": "chan",
            "date": "2024-03-01T10:00:00",
            "message": null,
            "media_type": "MessageMediaPhoto",
            "media_url": "media/10.jpg",
            "author": { "name": "Editor", "avatar": null, "link": null },
            "grouped_id": 77,
            "layout": { "total_width": 1000.0, "total_height": 500.0, "image_count": 2, "cells": [] },
            "group_posts": [
                { "id": 1, "telegram_id": 10, "channel_id": "chan", "date": "2024-03-01T10:00:00", "grouped_id": 77 },
                { "id": 2, "telegram_id": 11, "channel_id": "chan", "date": "2024-03-01T10:00:01", "grouped_id": 77 }
            ],
            "comments": [
                { "id": 3, "telegram_id": 12, "channel_id": -100123, "date": "2024-03-01T11:00:00", "reply_to": 10 }
            ]
        });
        let wire: WireUnit = serde_json::from_value(raw).unwrap();
        let nested = NestedUnit::try_from(wire).unwrap();
        assert_eq!(nested.unit.author.as_ref().unwrap().name, "Editor");
        assert!(nested.unit.is_photo());
        assert_eq!(nested.unit.layout.as_ref().unwrap().image_count, 2);
        assert_eq!(nested.group_posts.len(), 2);
        assert_eq!(nested.comments[0].channel_id, "-100123");
        assert_eq!(nested.comments[0].reply_to, Some(10));
    }

    #[test]
    fn rejects_units_without_a_valid_date() {
        let raw = serde_json::json!({ "id": 1, "telegram_id": 1, "channel_id": "chan", "date": "soon" });
        let wire: WireUnit = serde_json::from_value(raw).unwrap();
        assert!(NestedUnit::try_from(wire).is_err());
    }

    #[test]
    fn latest_hidden_edit_wins() {
        let edits: WireEdits = serde_json::from_value(serde_json::json!({
            "edits": [
                { "changes": { "hidden": "true" } },
                { "changes": { "text": "x" } },
                { "changes": { "hidden": false } }
            ]
        }))
        .unwrap();
        assert!(!edits.hidden());

        let edits: WireEdits =
            serde_json::from_value(serde_json::json!({ "edits": [{ "changes": { "hidden": "true" } }] }))
                .unwrap();
        assert!(edits.hidden());
    }

    #[test]
    fn channel_settings_are_validated() {
        let wire: WireChannel = serde_json::from_value(serde_json::json!({
            "id": "chan",
            "discussion_group_id": 555,
            "settings": { "display": { "sort_order": "asc", "items_per_chunk": 0 } }
        }))
        .unwrap();
        let info = ChannelInfo::try_from(wire).unwrap();
        assert_eq!(info.discussion_group_id.as_deref(), Some("555"));
        assert_eq!(info.settings.sort_order, Some(SortOrder::Asc));
        assert_eq!(info.settings.items_per_chunk, None);

        let wire: WireChannel = serde_json::from_value(serde_json::json!({
            "id": "chan",
            "settings": { "display": { "sort_order": "sideways" } }
        }))
        .unwrap();
        assert!(ChannelInfo::try_from(wire).is_err());
    }
}
