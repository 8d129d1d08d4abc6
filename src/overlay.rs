use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::join;
use futures::stream::{self, StreamExt};
use log::warn;

use crate::data::ChannelService;
use crate::error::Error;
use crate::model::{ContentUnit, GroupKey, Layout, UnitId};

pub const DEFAULT_CONCURRENCY: usize = 16;

/// Run one fallible future per input with bounded concurrency and collect
/// the results in input order. A failure never cancels the others.
pub async fn settle_all<I, F, Fut, T>(inputs: I, concurrency: usize, f: F) -> Vec<anyhow::Result<T>>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    stream::iter(inputs)
        .map(f)
        .buffered(concurrency.max(1))
        .collect()
        .await
}

/// Per-unit enrichment of an assembled page: hidden flags for every unit
/// and a gallery layout for every album.
pub struct Overlay<'a> {
    service: &'a dyn ChannelService,
    concurrency: usize,
}

impl<'a> Overlay<'a> {
    pub fn new(service: &'a dyn ChannelService, concurrency: usize) -> Self {
        Self {
            service,
            concurrency: concurrency.max(1),
        }
    }

    /// Both lookups run concurrently. A failed hidden lookup reads as
    /// visible. A stored layout replaces whatever the unit already carries;
    /// when the lookup fails or finds nothing, a layout that arrived
    /// embedded in the posts is kept, and an album without one stays plain.
    pub async fn apply(&self, mut units: Vec<ContentUnit>) -> Vec<ContentUnit> {
        let (hidden, layouts) = join(self.hidden_states(&units), self.layouts(&units)).await;

        for (unit, hidden) in units.iter_mut().zip(hidden) {
            unit.is_hidden = hidden;
        }
        for unit in units.iter_mut() {
            let key = unit.group().map(|(channel, group)| (channel.to_string(), group));
            if let Some(layout) = key.and_then(|key| layouts.get(&key)) {
                unit.layout = Some(Arc::clone(layout));
            }
        }
        units
    }

    async fn hidden_states(&self, units: &[ContentUnit]) -> Vec<bool> {
        let keys: Vec<(&str, UnitId)> = units
            .iter()
            .map(|unit| (unit.channel_id.as_str(), unit.id))
            .collect();
        let results = settle_all(0..keys.len(), self.concurrency, |i: usize| {
            let (channel, id) = keys[i];
            self.service.fetch_hidden_state(channel, id)
        })
        .await;

        keys.iter()
            .zip(results)
            .map(|((_, id), result)| match result {
                Ok(hidden) => hidden,
                Err(err) => {
                    warn!("{}", Error::enrichment(format!("hidden state of {id}"), err));
                    false
                }
            })
            .collect()
    }

    /// One request per distinct album; only photo units carry layouts.
    async fn layouts(&self, units: &[ContentUnit]) -> HashMap<(String, GroupKey), Arc<Layout>> {
        let mut seen = HashSet::new();
        let groups: Vec<(&str, GroupKey)> = units
            .iter()
            .filter(|unit| unit.is_photo())
            .filter_map(ContentUnit::group)
            .filter(|key| seen.insert(*key))
            .collect();

        let results = settle_all(0..groups.len(), self.concurrency, |i: usize| {
            let (channel, group) = groups[i];
            self.service.fetch_layout(channel, group)
        })
        .await;

        let mut layouts = HashMap::new();
        for ((channel, group), result) in groups.into_iter().zip(results) {
            match result {
                Ok(Some(layout)) => {
                    layouts.insert((channel.to_string(), group), Arc::new(layout));
                }
                Ok(None) => {}
                Err(err) => warn!("{}", Error::enrichment(format!("layout of group {group}"), err)),
            }
        }
        layouts
    }
}
