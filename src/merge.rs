use std::collections::HashSet;

use futures::join;
use log::warn;

use crate::data::{ChannelService, UnitBatch, UnitQuery};
use crate::error::Error;
use crate::flatten::flatten;
use crate::model::{ChannelInfo, ContentUnit, UnitId};

/// Concatenate partitions in order, keeping the first occurrence of every
/// identity.
pub fn merge<P>(partitions: P) -> Vec<ContentUnit>
where
    P: IntoIterator,
    P::Item: IntoIterator<Item = ContentUnit>,
{
    let mut seen: HashSet<UnitId> = HashSet::new();
    partitions
        .into_iter()
        .flatten()
        .filter(|unit| seen.insert(unit.id))
        .collect()
}

fn partitions(batch: UnitBatch) -> [Vec<ContentUnit>; 2] {
    [flatten(batch.units), flatten(batch.comments)]
}

/// Fetch the units for one view and normalize them into a single flat,
/// duplicate-free sequence.
///
/// A chunk request is served by the backend in one call. The unpaginated
/// view reads the channel and its discussion group concurrently. The main
/// partition already carries comments under their posts, so a failed
/// discussion read is logged and the view is built without it.
pub async fn fetch_merged(
    service: &dyn ChannelService,
    channel: &ChannelInfo,
    query: &UnitQuery,
) -> Result<Vec<ContentUnit>, Error> {
    if query.chunk.is_some() {
        let batch = service
            .fetch_units(&channel.id, query)
            .await
            .map_err(|err| Error::upstream(format!("units of {}", channel.id), err))?;
        return Ok(merge(partitions(batch)));
    }

    let main = service.fetch_units(&channel.id, query);
    let discussion = async {
        match &channel.discussion_group_id {
            Some(group) => match service.fetch_units(group, query).await {
                Ok(batch) => batch,
                Err(err) => {
                    warn!("{}", Error::enrichment(format!("discussion group {group}"), err));
                    UnitBatch::default()
                }
            },
            None => UnitBatch::default(),
        }
    };
    let (main, discussion) = join!(main, discussion);
    let main = main.map_err(|err| Error::upstream(format!("units of {}", channel.id), err))?;
    Ok(merge(
        partitions(main)
            .into_iter()
            .chain(partitions(discussion)),
    ))
}
