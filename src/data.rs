use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::chunking::{self, PlanSummary};
use crate::client::{Client, PlanQuery};
use crate::error::Error;
use crate::model::{ChannelInfo, ContentUnit, GroupKey, Layout, NestedUnit, UnitId};
use crate::settings::PartialSettings;

/// Which units to fetch: one chunk of the plan, or the whole channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitQuery {
    pub chunk: Option<usize>,
    pub plan: PlanQuery,
}

/// Units as the backend delivers them: the main partition in the nested
/// shape, plus a separate comments partition that may repeat embedded
/// comments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UnitBatch {
    pub units: Vec<NestedUnit>,
    pub comments: Vec<NestedUnit>,
}

#[async_trait]
pub trait ChannelService: Send + Sync {
    async fn fetch_channel_info(&self, channel_id: &str) -> Result<ChannelInfo>;
    async fn fetch_chunk_plan(&self, channel_id: &str, params: &PlanQuery) -> Result<PlanSummary>;
    async fn fetch_units(&self, channel_id: &str, query: &UnitQuery) -> Result<UnitBatch>;
    async fn fetch_hidden_state(&self, channel_id: &str, unit: UnitId) -> Result<bool>;
    /// `Ok(None)` when no layout has been generated for the album.
    async fn fetch_layout(&self, channel_id: &str, group: GroupKey) -> Result<Option<Layout>>;
    /// Store a display preference; returns the full saved layer.
    async fn persist_settings(
        &self,
        channel_id: &str,
        settings: &PartialSettings,
    ) -> Result<PartialSettings>;
    async fn set_unit_hidden(&self, channel_id: &str, unit: UnitId, hidden: bool) -> Result<()>;
}

pub struct HttpChannelService {
    client: Arc<Client>,
}

impl HttpChannelService {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelService for HttpChannelService {
    async fn fetch_channel_info(&self, channel_id: &str) -> Result<ChannelInfo> {
        self.client
            .channel(channel_id)
            .await
            .context("fetch channel info")
    }

    async fn fetch_chunk_plan(&self, channel_id: &str, params: &PlanQuery) -> Result<PlanSummary> {
        self.client
            .chunk_plan(channel_id, *params)
            .await
            .context("fetch chunk plan")
    }

    async fn fetch_units(&self, channel_id: &str, query: &UnitQuery) -> Result<UnitBatch> {
        let what = match query.chunk {
            Some(index) => format!("fetch chunk {index}"),
            None => "fetch channel posts".to_string(),
        };
        let units = self
            .client
            .channel_posts(channel_id, query.chunk, query.plan)
            .await
            .context(what)?;
        // comments arrive embedded in their posts
        Ok(UnitBatch {
            units,
            comments: Vec::new(),
        })
    }

    async fn fetch_hidden_state(&self, channel_id: &str, unit: UnitId) -> Result<bool> {
        self.client
            .hidden_state(channel_id, unit)
            .await
            .with_context(|| format!("fetch hidden state of {unit}"))
    }

    async fn fetch_layout(&self, channel_id: &str, group: GroupKey) -> Result<Option<Layout>> {
        self.client
            .layout(channel_id, group)
            .await
            .with_context(|| format!("fetch layout of group {group}"))
    }

    async fn persist_settings(
        &self,
        channel_id: &str,
        settings: &PartialSettings,
    ) -> Result<PartialSettings> {
        self.client
            .update_settings(channel_id, settings)
            .await
            .context("save display settings")
    }

    async fn set_unit_hidden(&self, channel_id: &str, unit: UnitId, hidden: bool) -> Result<()> {
        self.client
            .set_hidden(channel_id, unit, hidden)
            .await
            .with_context(|| format!("update visibility of {unit}"))
    }
}

#[derive(Default)]
struct MemoryState {
    channels: HashMap<String, ChannelInfo>,
    units: HashMap<String, Vec<ContentUnit>>,
    hidden: HashMap<(String, UnitId), bool>,
    layouts: HashMap<(String, GroupKey), Layout>,
    fail_hidden: HashSet<UnitId>,
    fail_layout: HashSet<GroupKey>,
    fail_units: bool,
    fail_persist: bool,
}

/// In-process backend. Plans with the local chunk planner and supports
/// failure injection per call kind.
#[derive(Default)]
pub struct MemoryChannelService {
    state: RwLock<MemoryState>,
    layout_requests: AtomicUsize,
    hidden_requests: AtomicUsize,
}

impl MemoryChannelService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(self, info: ChannelInfo, units: Vec<ContentUnit>) -> Self {
        self.insert_channel(info, units);
        self
    }

    pub fn insert_channel(&self, info: ChannelInfo, units: Vec<ContentUnit>) {
        let mut state = self.state.write();
        state.units.insert(info.id.clone(), units);
        state.channels.insert(info.id.clone(), info);
    }

    pub fn insert_layout(&self, channel_id: &str, group: GroupKey, layout: Layout) {
        self.state
            .write()
            .layouts
            .insert((channel_id.to_string(), group), layout);
    }

    pub fn mark_hidden(&self, channel_id: &str, unit: UnitId, hidden: bool) {
        self.state
            .write()
            .hidden
            .insert((channel_id.to_string(), unit), hidden);
    }

    pub fn fail_hidden_for(&self, unit: UnitId) {
        self.state.write().fail_hidden.insert(unit);
    }

    pub fn fail_layout_for(&self, group: GroupKey) {
        self.state.write().fail_layout.insert(group);
    }

    pub fn fail_units(&self, fail: bool) {
        self.state.write().fail_units = fail;
    }

    pub fn fail_persist(&self, fail: bool) {
        self.state.write().fail_persist = fail;
    }

    pub fn saved_settings(&self, channel_id: &str) -> Option<PartialSettings> {
        self.state
            .read()
            .channels
            .get(channel_id)
            .map(|info| info.settings)
    }

    pub fn layout_requests(&self) -> usize {
        self.layout_requests.load(Ordering::SeqCst)
    }

    pub fn hidden_requests(&self) -> usize {
        self.hidden_requests.load(Ordering::SeqCst)
    }

    /// The channel's own units followed by its discussion group's.
    fn thread_units(&self, channel_id: &str) -> Result<Vec<ContentUnit>> {
        let state = self.state.read();
        let info = state
            .channels
            .get(channel_id)
            .ok_or_else(|| anyhow!("channel {channel_id} not found"))?;
        let mut units = state.units.get(channel_id).cloned().unwrap_or_default();
        if let Some(group) = &info.discussion_group_id {
            units.extend(state.units.get(group).cloned().unwrap_or_default());
        }
        Ok(units)
    }
}

#[async_trait]
impl ChannelService for MemoryChannelService {
    async fn fetch_channel_info(&self, channel_id: &str) -> Result<ChannelInfo> {
        self.state
            .read()
            .channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| anyhow!("channel {channel_id} not found"))
    }

    async fn fetch_chunk_plan(&self, channel_id: &str, params: &PlanQuery) -> Result<PlanSummary> {
        let units = self.thread_units(channel_id)?;
        let plan = chunking::plan(
            &units,
            params.items_per_chunk,
            params.overflow_threshold,
            params.sort_order,
        )?;
        Ok(plan.summary())
    }

    async fn fetch_units(&self, channel_id: &str, query: &UnitQuery) -> Result<UnitBatch> {
        if self.state.read().fail_units {
            bail!("units of {channel_id} unavailable");
        }
        let units = self.thread_units(channel_id)?;
        let plan = chunking::plan(
            &units,
            query.plan.items_per_chunk,
            query.plan.overflow_threshold,
            query.plan.sort_order,
        )?;
        let Some(index) = query.chunk else {
            // every chunk in plan order, comments still nested in their posts
            return Ok(UnitBatch {
                units: plan
                    .all_items()
                    .iter()
                    .flat_map(|item| item.to_nested())
                    .collect(),
                comments: Vec::new(),
            });
        };
        let items = plan.items(index).ok_or(Error::ChunkOutOfRange {
            index,
            total: plan.len(),
        })?;
        let comments = items
            .iter()
            .flat_map(|item| item.comments.iter().cloned())
            .map(NestedUnit::from)
            .collect();
        Ok(UnitBatch {
            units: items.iter().flat_map(|item| item.to_nested()).collect(),
            comments,
        })
    }

    async fn fetch_hidden_state(&self, channel_id: &str, unit: UnitId) -> Result<bool> {
        self.hidden_requests.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read();
        if state.fail_hidden.contains(&unit) {
            bail!("edits of {unit} unavailable");
        }
        Ok(state
            .hidden
            .get(&(channel_id.to_string(), unit))
            .copied()
            .unwrap_or(false))
    }

    async fn fetch_layout(&self, channel_id: &str, group: GroupKey) -> Result<Option<Layout>> {
        self.layout_requests.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read();
        if state.fail_layout.contains(&group) {
            bail!("layout of group {group} unavailable");
        }
        Ok(state.layouts.get(&(channel_id.to_string(), group)).cloned())
    }

    async fn persist_settings(
        &self,
        channel_id: &str,
        settings: &PartialSettings,
    ) -> Result<PartialSettings> {
        let mut state = self.state.write();
        if state.fail_persist {
            bail!("settings of {channel_id} could not be stored");
        }
        let info = state
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| anyhow!("channel {channel_id} not found"))?;
        info.settings = info.settings.merged(*settings);
        Ok(info.settings)
    }

    async fn set_unit_hidden(&self, channel_id: &str, unit: UnitId, hidden: bool) -> Result<()> {
        self.mark_hidden(channel_id, unit, hidden);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::flatten;
    use crate::model::SortOrder;
    use chrono::{TimeZone, Utc};

    fn unit(id: UnitId, channel: &str, reply_to: Option<UnitId>) -> ContentUnit {
        let mut unit = ContentUnit::new(id, channel, Utc.timestamp_opt(1_700_000_000 + id * 60, 0).unwrap());
        unit.reply_to = reply_to;
        unit
    }

    fn service() -> MemoryChannelService {
        let mut info = ChannelInfo::new("chan");
        info.discussion_group_id = Some("chat".into());
        MemoryChannelService::new()
            .with_channel(
                info,
                vec![unit(1, "chan", None), unit(2, "chan", None), unit(3, "chan", None)],
            )
            .with_channel(
                ChannelInfo::new("chat"),
                vec![unit(4, "chat", Some(1)), unit(5, "chat", Some(3))],
            )
    }

    fn query(chunk: Option<usize>) -> UnitQuery {
        UnitQuery {
            chunk,
            plan: PlanQuery {
                items_per_chunk: 2,
                overflow_threshold: 0.0,
                sort_order: SortOrder::Asc,
            },
        }
    }

    #[tokio::test]
    async fn chunk_batch_embeds_discussion_comments() {
        let service = service();
        let batch = service.fetch_units("chan", &query(Some(0))).await.unwrap();
        let ids: Vec<UnitId> = flatten(batch.units).iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![1, 4]);
        assert_eq!(batch.comments.len(), 1);

        let plan = service.fetch_chunk_plan("chan", &query(None).plan).await.unwrap();
        assert_eq!(plan.totals.total_chunks, 3);
        assert_eq!(plan.totals.total_comments, 2);
    }

    #[tokio::test]
    async fn whole_channel_keeps_comments_under_their_posts() {
        let service = service();
        let batch = service.fetch_units("chan", &query(None)).await.unwrap();
        assert!(batch.comments.is_empty());
        let ids: Vec<UnitId> = flatten(batch.units).iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![1, 4, 2, 3, 5]);
    }

    #[tokio::test]
    async fn out_of_range_chunk_is_reported() {
        let err = service()
            .fetch_units("chan", &query(Some(7)))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ChunkOutOfRange { index: 7, total: 3 })
        ));
    }

    #[tokio::test]
    async fn persisted_settings_merge_into_the_saved_layer() {
        let service = service();
        let saved = service
            .persist_settings(
                "chan",
                &PartialSettings {
                    items_per_chunk: Some(20),
                    ..PartialSettings::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(saved.items_per_chunk, Some(20));
        let saved = service
            .persist_settings(
                "chan",
                &PartialSettings {
                    sort_order: Some(SortOrder::Asc),
                    ..PartialSettings::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(saved.items_per_chunk, Some(20));
        assert_eq!(
            service.fetch_channel_info("chan").await.unwrap().settings,
            saved
        );
    }

    #[tokio::test]
    async fn injected_failures_surface_as_errors() {
        let service = service();
        service.fail_hidden_for(2);
        assert!(service.fetch_hidden_state("chan", 2).await.is_err());
        assert!(!service.fetch_hidden_state("chan", 1).await.unwrap());
        service.fail_units(true);
        assert!(service.fetch_units("chan", &query(None)).await.is_err());
    }
}
