//! Chunk cursor over one channel.
//!
//! Every transition records the target it is loading. When the fetch
//! completes, the result is committed only if that target is still the most
//! recently requested one. Pages are published as whole `Arc<Page>` values
//! and replaced, never edited in place.

use std::fmt;
use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::chunking::{ChunkInfo, PlanSummary};
use crate::client::PlanQuery;
use crate::data::{ChannelService, UnitQuery};
use crate::error::Error;
use crate::filtering::should_hide_unit;
use crate::flatten::{assign_group_layout, group_by_parent, PageCounts, Threads};
use crate::merge::fetch_merged;
use crate::model::{ChannelInfo, ContentUnit, GroupKey, Layout, SortOrder, UnitId};
use crate::notify::{Notice, Notifier, NoopNotifier};
use crate::overlay::{Overlay, DEFAULT_CONCURRENCY};
use crate::settings::{resolve, Defaults, EffectiveSettings, PartialSettings, ViewQuery};

/// What a load fetches. Two loads with equal targets are interchangeable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub channel_id: String,
    pub chunk: Option<usize>,
    pub sort_order: SortOrder,
    pub items_per_chunk: usize,
    pub overflow_threshold: f64,
}

impl Target {
    fn plan_query(&self) -> PlanQuery {
        PlanQuery {
            items_per_chunk: self.items_per_chunk,
            overflow_threshold: self.overflow_threshold,
            sort_order: self.sort_order,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.chunk {
            Some(index) => write!(f, "{} chunk {}", self.channel_id, index)?,
            None => write!(f, "{} (all)", self.channel_id)?,
        }
        write!(
            f,
            " [{} x{} +{}]",
            self.sort_order, self.items_per_chunk, self.overflow_threshold
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct Cursor {
    /// `None` is the unpaginated view.
    pub current: Option<usize>,
    pub total_chunks: usize,
    pub total_posts: usize,
    pub total_comments: usize,
    pub total_units: usize,
    pub has_next: bool,
    pub has_prev: bool,
}

impl Cursor {
    fn new(current: Option<usize>, plan: &PlanSummary) -> Self {
        let totals = plan.totals;
        Self {
            current,
            total_chunks: totals.total_chunks,
            total_posts: totals.total_posts,
            total_comments: totals.total_comments,
            total_units: totals.total_units,
            has_next: current
                .map(|index| index + 1 < totals.total_chunks)
                .unwrap_or(false),
            has_prev: current.map(|index| index > 0).unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub target: Target,
    pub settings: EffectiveSettings,
    pub cursor: Cursor,
    pub chunk: Option<ChunkInfo>,
    pub counts: PageCounts,
    pub units: Vec<ContentUnit>,
}

impl Page {
    /// Units the renderer shows; the stored list keeps every unit.
    pub fn visible_units(&self) -> impl Iterator<Item = &ContentUnit> {
        self.units.iter().filter(|unit| !should_hide_unit(unit))
    }

    pub fn threads(&self) -> Threads {
        group_by_parent(&self.units)
    }
}

#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Committed(Arc<Page>),
    /// A newer transition was requested while this one was in flight.
    Discarded,
    /// The transition was a no-op.
    Unchanged,
}

impl LoadOutcome {
    pub fn page(&self) -> Option<&Arc<Page>> {
        match self {
            LoadOutcome::Committed(page) => Some(page),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct NavigatorOptions {
    pub defaults: Defaults,
    pub overlay_concurrency: usize,
    pub notifier: Arc<dyn Notifier>,
}

impl Default for NavigatorOptions {
    fn default() -> Self {
        Self {
            defaults: Defaults::default(),
            overlay_concurrency: DEFAULT_CONCURRENCY,
            notifier: Arc::new(NoopNotifier),
        }
    }
}

#[derive(Default)]
struct NavState {
    channel: Option<ChannelInfo>,
    overrides: PartialSettings,
    chunk: Option<usize>,
    requested: Option<Target>,
    last_error: Option<String>,
}

pub struct Navigator {
    service: Arc<dyn ChannelService>,
    channel_id: String,
    defaults: Defaults,
    overlay_concurrency: usize,
    notifier: Arc<dyn Notifier>,
    state: Mutex<NavState>,
    page: RwLock<Option<Arc<Page>>>,
}

impl Navigator {
    pub fn new(
        service: Arc<dyn ChannelService>,
        channel_id: impl Into<String>,
        options: NavigatorOptions,
    ) -> Self {
        Self {
            service,
            channel_id: channel_id.into(),
            defaults: options.defaults,
            overlay_concurrency: options.overlay_concurrency,
            notifier: options.notifier,
            state: Mutex::new(NavState::default()),
            page: RwLock::new(None),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Replace the request-scoped layer and the requested chunk. Takes
    /// effect on the next load.
    pub fn apply_query(&self, query: ViewQuery) {
        let mut state = self.state.lock();
        state.overrides = query.settings;
        state.chunk = query.chunk;
    }

    pub fn current_page(&self) -> Option<Arc<Page>> {
        self.page.read().clone()
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.page.read().as_ref().map(|page| page.cursor)
    }

    pub fn effective_settings(&self) -> EffectiveSettings {
        let state = self.state.lock();
        self.resolve_with(&state)
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    fn resolve_with(&self, state: &NavState) -> EffectiveSettings {
        let saved = state
            .channel
            .as_ref()
            .map(|channel| channel.settings)
            .unwrap_or_default();
        resolve(&state.overrides, &saved, &self.defaults)
    }

    /// Fetch, normalize and enrich the currently requested view.
    pub async fn load(&self) -> Result<LoadOutcome, Error> {
        let channel = self.channel().await?;
        let (target, settings) = self.request()?;

        let result = self.fetch_page(&channel, &target, settings).await;
        match self.commit(&target, result) {
            Ok(page) => Ok(LoadOutcome::Committed(page)),
            Err(Error::StaleResultDiscarded { target }) => {
                debug!("navigator: {}", Error::StaleResultDiscarded { target });
                Ok(LoadOutcome::Discarded)
            }
            Err(err) => Err(err),
        }
    }

    /// Re-read channel info (saved settings, discussion group) and reload.
    pub async fn refresh(&self) -> Result<LoadOutcome, Error> {
        self.state.lock().channel = None;
        self.load().await
    }

    pub async fn go_to(&self, chunk: Option<usize>) -> Result<LoadOutcome, Error> {
        if let (Some(index), Some(cursor)) = (chunk, self.cursor()) {
            if cursor.total_chunks > 0 && index >= cursor.total_chunks {
                return Err(Error::ChunkOutOfRange {
                    index,
                    total: cursor.total_chunks,
                });
            }
        }
        self.state.lock().chunk = chunk;
        self.load().await
    }

    pub async fn next(&self) -> Result<LoadOutcome, Error> {
        match self.cursor() {
            Some(Cursor {
                current: Some(index),
                has_next: true,
                ..
            }) => self.go_to(Some(index + 1)).await,
            _ => Ok(LoadOutcome::Unchanged),
        }
    }

    pub async fn prev(&self) -> Result<LoadOutcome, Error> {
        match self.cursor() {
            Some(Cursor {
                current: Some(index),
                has_prev: true,
                ..
            }) => self.go_to(Some(index - 1)).await,
            _ => Ok(LoadOutcome::Unchanged),
        }
    }

    /// Chunk boundaries depend on the sort order, so a paginated cursor
    /// restarts at chunk 0.
    pub async fn set_sort_order(&self, order: SortOrder) -> Result<LoadOutcome, Error> {
        {
            let mut state = self.state.lock();
            state.overrides.sort_order = Some(order);
            state.chunk = state.chunk.map(|_| 0);
        }
        self.load().await
    }

    pub async fn toggle_sort_order(&self) -> Result<LoadOutcome, Error> {
        let current = self.effective_settings().sort_order.value;
        self.set_sort_order(current.reversed()).await
    }

    pub async fn set_items_per_chunk(&self, items_per_chunk: usize) -> Result<LoadOutcome, Error> {
        if items_per_chunk == 0 {
            return Err(Error::InvalidConfiguration(
                "items_per_chunk must be positive".into(),
            ));
        }
        {
            let mut state = self.state.lock();
            state.overrides.items_per_chunk = Some(items_per_chunk);
            state.chunk = state.chunk.map(|_| 0);
        }
        self.load().await
    }

    /// Persist the effective view as the channel's saved preference and drop
    /// the request-scoped overrides. The visible page stays; only its
    /// sources change.
    pub async fn save_current_as_default(&self) -> Result<EffectiveSettings, Error> {
        let effective = self.effective_settings();
        effective.validate()?;
        let saved = match self
            .service
            .persist_settings(&self.channel_id, &effective.to_partial())
            .await
        {
            Ok(saved) => saved,
            Err(err) => {
                let err = Error::upstream("save display settings", err);
                self.notifier.notify(Notice::SaveFailed {
                    channel_id: self.channel_id.clone(),
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        let settings = {
            let mut state = self.state.lock();
            state.overrides = PartialSettings::default();
            if let Some(channel) = state.channel.as_mut() {
                channel.settings = saved;
            }
            self.resolve_with(&state)
        };
        self.republish(|page| page.settings = settings);
        info!(
            "navigator: saved {} x{} +{} for {}",
            settings.sort_order.value,
            settings.items_per_chunk.value,
            settings.overflow_threshold.value,
            self.channel_id
        );
        self.notifier.notify(Notice::SettingsSaved {
            channel_id: self.channel_id.clone(),
        });
        Ok(settings)
    }

    /// Drop the request-scoped overrides and load the saved view.
    pub async fn reset_to_saved(&self) -> Result<LoadOutcome, Error> {
        {
            let mut state = self.state.lock();
            let before = self.resolve_with(&state);
            state.overrides = PartialSettings::default();
            let after = self.resolve_with(&state);
            let same_plan = before.sort_order.value == after.sort_order.value
                && before.items_per_chunk.value == after.items_per_chunk.value
                && before.overflow_threshold.value == after.overflow_threshold.value;
            if !same_plan {
                state.chunk = state.chunk.map(|_| 0);
            }
        }
        self.load().await
    }

    /// Persist a visibility override and publish it on the current page.
    pub async fn set_unit_hidden(&self, unit: UnitId, hidden: bool) -> Result<(), Error> {
        let channel_id = self
            .current_page()
            .and_then(|page| {
                page.units
                    .iter()
                    .find(|u| u.id == unit)
                    .map(|u| u.channel_id.clone())
            })
            .unwrap_or_else(|| self.channel_id.clone());

        self.service
            .set_unit_hidden(&channel_id, unit, hidden)
            .await
            .map_err(|err| Error::upstream(format!("visibility of {unit}"), err))?;

        self.republish(|page| {
            for u in page.units.iter_mut().filter(|u| u.id == unit) {
                u.is_hidden = hidden;
            }
        });
        self.notifier
            .notify(Notice::VisibilityChanged { unit, hidden });
        Ok(())
    }

    /// Publish a new layout for one album; every member shares it.
    pub fn update_group_layout(&self, channel_id: &str, group: GroupKey, layout: Layout) -> usize {
        let layout = Arc::new(layout);
        let mut assigned = 0;
        self.republish(|page| {
            assigned = assign_group_layout(&mut page.units, channel_id, group, layout);
        });
        assigned
    }

    async fn channel(&self) -> Result<ChannelInfo, Error> {
        let cached = self.state.lock().channel.clone();
        if let Some(channel) = cached {
            return Ok(channel);
        }
        match self.service.fetch_channel_info(&self.channel_id).await {
            Ok(channel) => {
                self.state.lock().channel = Some(channel.clone());
                Ok(channel)
            }
            Err(err) => {
                let err = Error::upstream(format!("channel {}", self.channel_id), err);
                Err(self.fail(&self.channel_id, err))
            }
        }
    }

    /// Resolve the view and mark it as the most recent request.
    fn request(&self) -> Result<(Target, EffectiveSettings), Error> {
        let mut state = self.state.lock();
        let settings = self.resolve_with(&state);
        settings.validate()?;
        let target = Target {
            channel_id: self.channel_id.clone(),
            chunk: state.chunk,
            sort_order: settings.sort_order.value,
            items_per_chunk: settings.items_per_chunk.value,
            overflow_threshold: settings.overflow_threshold.value,
        };
        state.requested = Some(target.clone());
        Ok((target, settings))
    }

    async fn fetch_page(
        &self,
        channel: &ChannelInfo,
        target: &Target,
        settings: EffectiveSettings,
    ) -> Result<Page, Error> {
        let service = self.service.as_ref();
        let plan_query = target.plan_query();
        let plan = service
            .fetch_chunk_plan(&channel.id, &plan_query)
            .await
            .map_err(|err| Error::upstream(format!("chunk plan of {}", channel.id), err))?;

        let total = plan.totals.total_chunks;
        let units = match target.chunk {
            // an empty channel still has a first page
            Some(0) if total == 0 => Vec::new(),
            Some(index) if index >= total => {
                return Err(Error::ChunkOutOfRange { index, total });
            }
            chunk => {
                let query = UnitQuery {
                    chunk,
                    plan: plan_query,
                };
                let units = fetch_merged(service, channel, &query).await?;
                Overlay::new(service, self.overlay_concurrency)
                    .apply(units)
                    .await
            }
        };

        Ok(Page {
            target: target.clone(),
            settings,
            cursor: Cursor::new(target.chunk, &plan),
            chunk: target.chunk.and_then(|index| plan.chunks.get(index).cloned()),
            counts: PageCounts::of(&units),
            units,
        })
    }

    fn commit(&self, target: &Target, result: Result<Page, Error>) -> Result<Arc<Page>, Error> {
        let mut state = self.state.lock();
        if state.requested.as_ref() != Some(target) {
            return Err(Error::StaleResultDiscarded {
                target: target.to_string(),
            });
        }
        match result {
            Ok(page) => {
                state.last_error = None;
                let page = Arc::new(page);
                *self.page.write() = Some(Arc::clone(&page));
                debug!(
                    "navigator: committed {} ({} units, {} posts, {} comments)",
                    target, page.counts.units, page.counts.posts, page.counts.comments
                );
                Ok(page)
            }
            Err(err) => {
                drop(state);
                Err(self.fail(&target.to_string(), err))
            }
        }
    }

    /// Record a failed top-level load. The last good page stays published.
    fn fail(&self, target: &str, err: Error) -> Error {
        let message = err.to_string();
        error!("navigator: load {target} failed: {message}");
        self.state.lock().last_error = Some(message.clone());
        self.notifier.notify(Notice::LoadFailed {
            target: target.to_string(),
            message,
        });
        err
    }

    fn republish(&self, edit: impl FnOnce(&mut Page)) {
        let mut slot = self.page.write();
        if let Some(current) = slot.as_ref() {
            let mut next = Page::clone(current);
            edit(&mut next);
            *slot = Some(Arc::new(next));
        }
    }
}
