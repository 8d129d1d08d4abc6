//! Chunk planning.
//!
//! A channel is split into *content items*: a post, or an album, together
//! with every comment attached to it. Items are never split across chunks.
//! Weight is counted per unit: one per post, one per album photo, one per
//! comment.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::{ContentUnit, GroupKey, NestedUnit, SortOrder, UnitId};
use crate::settings::validate_chunking;

#[derive(Debug, Clone, PartialEq)]
pub struct ContentItem {
    /// The post itself, or every photo of the album in identity order.
    /// Empty for comments whose parent is not part of the stream.
    pub members: Vec<ContentUnit>,
    pub comments: Vec<ContentUnit>,
    date: DateTime<Utc>,
    anchor: UnitId,
}

impl ContentItem {
    pub fn weight(&self) -> usize {
        self.members.len() + self.comments.len()
    }

    pub fn is_top_level(&self) -> bool {
        !self.members.is_empty()
    }

    pub fn is_album(&self) -> bool {
        self.members
            .first()
            .map(|unit| unit.grouped_id.is_some())
            .unwrap_or(false)
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    pub fn anchor(&self) -> UnitId {
        self.anchor
    }

    /// Units in page order: members first, then comments.
    pub fn units(&self) -> impl Iterator<Item = &ContentUnit> {
        self.members.iter().chain(self.comments.iter())
    }

    /// Rebuild the nested API shape for this item. Orphaned comments come
    /// back as plain units.
    pub fn to_nested(&self) -> Vec<NestedUnit> {
        let Some(head) = self.members.first() else {
            return self.comments.iter().cloned().map(NestedUnit::from).collect();
        };
        let group_posts = if self.is_album() {
            self.members.clone()
        } else {
            Vec::new()
        };
        vec![NestedUnit {
            unit: head.clone(),
            group_posts,
            comments: self.comments.clone(),
        }]
    }

    fn finish(mut members: Vec<ContentUnit>, mut comments: Vec<ContentUnit>) -> Option<Self> {
        members.sort_by_key(|unit| unit.id);
        comments.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
        let head = members.first().or_else(|| comments.first())?;
        let (date, anchor) = (head.date, head.id);
        Some(Self {
            members,
            comments,
            date,
            anchor,
        })
    }
}

/// Group flat units into content items ordered by (timestamp, identity)
/// in the given direction. Repeated identities are kept once.
pub fn build_items(units: &[ContentUnit], order: SortOrder) -> Vec<ContentItem> {
    let mut seen = HashSet::new();
    let mut slots: Vec<(Vec<ContentUnit>, Vec<ContentUnit>)> = Vec::new();
    let mut albums: HashMap<(&str, GroupKey), usize> = HashMap::new();
    let mut owner: HashMap<UnitId, usize> = HashMap::new();
    let mut comments: Vec<&ContentUnit> = Vec::new();

    for unit in units {
        if !seen.insert(unit.id) {
            continue;
        }
        if unit.is_comment() {
            comments.push(unit);
            continue;
        }
        let slot = match unit.group() {
            Some(key) => *albums.entry(key).or_insert_with(|| {
                slots.push((Vec::new(), Vec::new()));
                slots.len() - 1
            }),
            None => {
                slots.push((Vec::new(), Vec::new()));
                slots.len() - 1
            }
        };
        slots[slot].0.push(unit.clone());
        owner.insert(unit.id, slot);
    }

    let by_id: HashMap<UnitId, &ContentUnit> =
        comments.iter().map(|unit| (unit.id, *unit)).collect();
    for comment in &comments {
        match thread_owner(comment, &owner, &by_id) {
            Some(slot) => slots[slot].1.push((*comment).clone()),
            None => slots.push((Vec::new(), vec![(*comment).clone()])),
        }
    }

    let mut items: Vec<ContentItem> = slots
        .into_iter()
        .filter_map(|(members, comments)| ContentItem::finish(members, comments))
        .collect();
    items.sort_by(|a, b| a.date.cmp(&b.date).then(a.anchor.cmp(&b.anchor)));
    if order == SortOrder::Desc {
        items.reverse();
    }
    items
}

/// Follow the reply chain up to the first top-level unit.
fn thread_owner(
    comment: &ContentUnit,
    owner: &HashMap<UnitId, usize>,
    comments: &HashMap<UnitId, &ContentUnit>,
) -> Option<usize> {
    let mut parent = comment.reply_to?;
    for _ in 0..=comments.len() {
        if let Some(slot) = owner.get(&parent) {
            return Some(*slot);
        }
        parent = comments.get(&parent)?.reply_to?;
    }
    None
}

/// Split a weight sequence into contiguous chunk ranges.
///
/// A chunk is closed once the next weight would push it past
/// `items_per_chunk`, unless everything left (this weight included) is
/// below `overflow_threshold * items_per_chunk`, in which case the whole
/// tail is absorbed into the current chunk. An empty chunk always takes the
/// next weight, so an oversized item ends up alone. A chunk that is already
/// over budget never absorbs.
pub fn partition(
    weights: &[usize],
    items_per_chunk: usize,
    overflow_threshold: f64,
) -> Result<Vec<Range<usize>>, Error> {
    validate_chunking(items_per_chunk, overflow_threshold)?;
    let absorb_below = overflow_threshold * items_per_chunk as f64;
    let mut remaining: usize = weights.iter().sum();
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut weight = 0;

    for (i, &w) in weights.iter().enumerate() {
        if i > start && weight + w > items_per_chunk {
            if weight <= items_per_chunk && (remaining as f64) < absorb_below {
                // the whole tail joins the current chunk
                break;
            }
            ranges.push(start..i);
            start = i;
            weight = 0;
        }
        weight += w;
        remaining -= w;
    }
    if start < weights.len() {
        ranges.push(start..weights.len());
    }
    Ok(ranges)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub index: usize,
    pub members: Vec<UnitId>,
    pub budget: usize,
    pub weight: usize,
    pub posts_count: usize,
    pub comments_count: usize,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    #[serde(skip)]
    items: Range<usize>,
}

impl Chunk {
    fn from_items(index: usize, budget: usize, range: Range<usize>, items: &[ContentItem]) -> Self {
        let slice = &items[range.clone()];
        let members: Vec<UnitId> = slice
            .iter()
            .flat_map(|item| item.units().map(|unit| unit.id))
            .collect();
        let date_from = slice.iter().flat_map(|item| item.units()).map(|unit| unit.date).min();
        let date_to = slice.iter().flat_map(|item| item.units()).map(|unit| unit.date).max();
        Self {
            index,
            members,
            budget,
            weight: slice.iter().map(ContentItem::weight).sum(),
            posts_count: slice.iter().filter(|item| item.is_top_level()).count(),
            comments_count: slice.iter().map(|item| item.comments.len()).sum(),
            date_from,
            date_to,
            items: range,
        }
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn info(&self) -> ChunkInfo {
        ChunkInfo {
            index: self.index,
            unit_count: self.members.len(),
            posts_count: self.posts_count,
            comments_count: self.comments_count,
            total_weight: self.weight,
            date_from: self.date_from,
            date_to: self.date_to,
        }
    }
}

/// Chunk metadata without member lists, as the plan endpoint reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: usize,
    #[serde(default)]
    pub unit_count: usize,
    pub posts_count: usize,
    pub comments_count: usize,
    pub total_weight: usize,
    #[serde(default)]
    pub date_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PlanTotals {
    pub total_chunks: usize,
    pub total_posts: usize,
    pub total_comments: usize,
    #[serde(default)]
    pub total_units: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub sort_order: SortOrder,
    pub items_per_chunk: usize,
    pub overflow_threshold: f64,
    pub chunks: Vec<ChunkInfo>,
    pub totals: PlanTotals,
}

/// Chunk boundaries over one channel's stream.
///
/// Every chunk weighs at most `items_per_chunk`, with two exceptions: a
/// chunk holding a single item heavier than the budget, and the last chunk
/// after it absorbed the tail. The absorbed tail may hold several items, so
/// the last chunk can exceed the budget while staying below
/// `items_per_chunk * (1 + overflow_threshold)`.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub sort_order: SortOrder,
    pub items_per_chunk: usize,
    pub overflow_threshold: f64,
    pub chunks: Vec<Chunk>,
    items: Vec<ContentItem>,
    index: HashMap<UnitId, usize>,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    pub fn chunk_of(&self, unit: UnitId) -> Option<usize> {
        self.index.get(&unit).copied()
    }

    pub fn members(&self, index: usize) -> Option<&[UnitId]> {
        self.chunks.get(index).map(|chunk| chunk.members.as_slice())
    }

    pub fn items(&self, index: usize) -> Option<&[ContentItem]> {
        self.chunks
            .get(index)
            .map(|chunk| &self.items[chunk.items.clone()])
    }

    pub fn all_items(&self) -> &[ContentItem] {
        &self.items
    }

    pub fn totals(&self) -> PlanTotals {
        PlanTotals {
            total_chunks: self.chunks.len(),
            total_posts: self.chunks.iter().map(|c| c.posts_count).sum(),
            total_comments: self.chunks.iter().map(|c| c.comments_count).sum(),
            total_units: self.index.len(),
        }
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            sort_order: self.sort_order,
            items_per_chunk: self.items_per_chunk,
            overflow_threshold: self.overflow_threshold,
            chunks: self.chunks.iter().map(Chunk::info).collect(),
            totals: self.totals(),
        }
    }
}

/// Plan chunk boundaries over a channel's units. Reversing `sort_order`
/// yields an independent plan; boundaries are not mirrored.
pub fn plan(
    units: &[ContentUnit],
    items_per_chunk: usize,
    overflow_threshold: f64,
    sort_order: SortOrder,
) -> Result<ChunkPlan, Error> {
    validate_chunking(items_per_chunk, overflow_threshold)?;
    let items = build_items(units, sort_order);
    let weights: Vec<usize> = items.iter().map(ContentItem::weight).collect();
    let ranges = partition(&weights, items_per_chunk, overflow_threshold)?;

    let chunks: Vec<Chunk> = ranges
        .into_iter()
        .enumerate()
        .map(|(index, range)| Chunk::from_items(index, items_per_chunk, range, &items))
        .collect();
    let index = chunks
        .iter()
        .flat_map(|chunk| chunk.members.iter().map(move |id| (*id, chunk.index)))
        .collect();

    Ok(ChunkPlan {
        sort_order,
        items_per_chunk,
        overflow_threshold,
        chunks,
        items,
        index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + minute * 60, 0).unwrap()
    }

    fn post(id: UnitId, minute: i64) -> ContentUnit {
        ContentUnit::new(id, "chan", at(minute))
    }

    fn comment(id: UnitId, parent: UnitId, minute: i64) -> ContentUnit {
        let mut unit = ContentUnit::new(id, "chat", at(minute));
        unit.reply_to = Some(parent);
        unit
    }

    fn photo(id: UnitId, group: GroupKey, minute: i64) -> ContentUnit {
        let mut unit = post(id, minute);
        unit.grouped_id = Some(group);
        unit
    }

    /// A post followed by `weight - 1` comments.
    fn weighted(first_id: UnitId, minute: i64, weight: usize) -> Vec<ContentUnit> {
        let mut units = vec![post(first_id, minute)];
        for n in 1..weight {
            units.push(comment(first_id + n as i64, first_id, minute));
        }
        units
    }

    #[test]
    fn small_remainder_stays_with_previous_item() {
        let ranges = partition(&[9, 1, 9, 1], 10, 0.3).unwrap();
        assert_eq!(ranges, vec![0..2, 2..4]);

        let ranges = partition(&[9, 2], 10, 0.3).unwrap();
        assert_eq!(ranges, vec![0..2]);

        let ranges = partition(&[8, 3, 1], 10, 0.3).unwrap();
        assert_eq!(ranges, vec![0..1, 1..3]);
    }

    #[test]
    fn absorbed_tail_can_push_the_last_chunk_over_budget() {
        let ranges = partition(&[9, 1, 1], 10, 0.3).unwrap();
        assert_eq!(ranges, vec![0..3]);

        let units: Vec<ContentUnit> = [9usize, 1, 1]
            .iter()
            .enumerate()
            .flat_map(|(n, size)| weighted(n as i64 * 100 + 1, n as i64, *size))
            .collect();
        let plan = plan(&units, 10, 0.3, SortOrder::Asc).unwrap();
        assert_eq!(plan.len(), 1);
        let last = plan.chunk(0).unwrap();
        assert_eq!(last.item_count(), 3);
        assert_eq!(last.weight, 11);
        assert!((last.weight as f64) < 10.0 * 1.3);
    }

    #[test]
    fn oversized_items_get_their_own_chunks() {
        let ranges = partition(&[3, 15, 12, 2], 10, 0.1).unwrap();
        assert_eq!(ranges, vec![0..1, 1..2, 2..3, 3..4]);

        // an over-budget chunk never absorbs the tail
        let ranges = partition(&[15, 1], 10, 0.3).unwrap();
        assert_eq!(ranges, vec![0..1, 1..2]);
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(matches!(
            partition(&[1], 0, 0.2),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(plan(&[], 10, 1.0, SortOrder::Desc).is_err());
    }

    #[test]
    fn empty_channel_has_no_chunks() {
        let plan = plan(&[], 10, 0.2, SortOrder::Desc).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.totals(), PlanTotals::default());
    }

    #[test]
    fn albums_count_once_but_weigh_per_photo() {
        let units = vec![
            photo(10, 7, 0),
            photo(11, 7, 0),
            photo(12, 7, 0),
            comment(13, 10, 1),
            post(20, 5),
        ];
        let items = build_items(&units, SortOrder::Asc);
        assert_eq!(items.len(), 2);
        assert!(items[0].is_album());
        assert_eq!(items[0].weight(), 4);
        assert_eq!(items[1].weight(), 1);

        let plan = plan(&units, 50, 0.2, SortOrder::Asc).unwrap();
        let chunk = plan.chunk(0).unwrap();
        assert_eq!(chunk.posts_count, 2);
        assert_eq!(chunk.comments_count, 1);
        assert_eq!(chunk.weight, 5);
        assert_eq!(chunk.members, vec![10, 11, 12, 13, 20]);
        assert_eq!(chunk.date_from, Some(at(0)));
        assert_eq!(chunk.date_to, Some(at(5)));
    }

    #[test]
    fn replies_to_comments_stay_in_the_thread() {
        let units = vec![post(1, 0), comment(2, 1, 1), comment(3, 2, 2), comment(4, 99, 3)];
        let items = build_items(&units, SortOrder::Asc);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].comments.len(), 2);
        assert!(!items[1].is_top_level());

        let plan = plan(&units, 10, 0.2, SortOrder::Asc).unwrap();
        assert_eq!(plan.totals().total_posts, 1);
        assert_eq!(plan.totals().total_comments, 3);
    }

    #[test]
    fn every_unit_lands_in_exactly_one_chunk() {
        let mut units = Vec::new();
        let sizes = [3usize, 1, 7, 2, 12, 1, 1, 4, 6, 2, 1];
        let mut next_id = 1;
        for (minute, size) in sizes.iter().enumerate() {
            units.extend(weighted(next_id, minute as i64, *size));
            next_id += 100;
        }

        for order in [SortOrder::Asc, SortOrder::Desc] {
            for (budget, threshold) in [(5, 0.2), (8, 0.5), (10, 0.0), (1, 0.9)] {
                let plan = plan(&units, budget, threshold, order).unwrap();
                let mut seen: Vec<UnitId> = plan
                    .chunks
                    .iter()
                    .flat_map(|c| c.members.iter().copied())
                    .collect();
                assert_eq!(seen.len(), units.len());
                seen.sort();
                let mut expected: Vec<UnitId> = units.iter().map(|u| u.id).collect();
                expected.sort();
                assert_eq!(seen, expected);

                let last = plan.len() - 1;
                for chunk in &plan.chunks {
                    let within_budget = chunk.weight <= budget;
                    let singleton = chunk.item_count() == 1;
                    let absorbed_tail = chunk.index == last
                        && (chunk.weight as f64) < budget as f64 * (1.0 + threshold);
                    assert!(
                        within_budget || singleton || absorbed_tail,
                        "chunk {} weight {} budget {}",
                        chunk.index,
                        chunk.weight,
                        budget
                    );
                }
            }
        }
    }

    #[test]
    fn chunk_queries_follow_sort_order() {
        let units: Vec<ContentUnit> = (0..6).map(|n| post(n + 1, n)).collect();
        let desc = plan(&units, 2, 0.0, SortOrder::Desc).unwrap();
        assert_eq!(desc.members(0), Some(&[6, 5][..]));
        assert_eq!(desc.chunk_of(1), Some(2));

        let asc = plan(&units, 2, 0.0, SortOrder::Asc).unwrap();
        assert_eq!(asc.members(0), Some(&[1, 2][..]));
        assert_eq!(asc.chunk_of(1), Some(0));
        assert_eq!(asc.members(3), None);
    }

    #[test]
    fn timestamp_ties_break_by_identity() {
        let units = vec![post(3, 0), post(1, 0), post(2, 0)];
        let plan = plan(&units, 10, 0.0, SortOrder::Asc).unwrap();
        assert_eq!(plan.members(0), Some(&[1, 2, 3][..]));
    }

    #[test]
    fn nested_shape_embeds_album_and_comments() {
        let units = vec![photo(10, 7, 0), photo(11, 7, 0), comment(12, 11, 1)];
        let items = build_items(&units, SortOrder::Desc);
        let nested = items[0].to_nested();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].unit.id, 10);
        assert_eq!(nested[0].group_posts.len(), 2);
        assert_eq!(nested[0].comments[0].id, 12);
    }
}
