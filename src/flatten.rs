use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::model::{ContentUnit, GroupKey, Layout, NestedUnit, UnitId};

/// Expand the nested API shape into one flat, order-preserving sequence.
///
/// Album posts are replaced by their group members (which already include
/// the representative post) and inherit the representative's layout.
/// Comments follow their post untouched, including their channel and parent
/// reference. Input without embedded lists comes back unchanged.
pub fn flatten(nested: Vec<NestedUnit>) -> Vec<ContentUnit> {
    let mut seen = HashSet::new();
    let mut flat = Vec::with_capacity(nested.len());

    for NestedUnit {
        unit,
        group_posts,
        comments,
    } in nested
    {
        if group_posts.is_empty() {
            push_once(&mut flat, &mut seen, unit);
        } else {
            let layout = unit.layout;
            for mut member in group_posts {
                if let Some(layout) = &layout {
                    member.layout = Some(Arc::clone(layout));
                }
                push_once(&mut flat, &mut seen, member);
            }
        }
        for comment in comments {
            push_once(&mut flat, &mut seen, comment);
        }
    }
    flat
}

fn push_once(flat: &mut Vec<ContentUnit>, seen: &mut HashSet<UnitId>, unit: ContentUnit) {
    if seen.insert(unit.id) {
        flat.push(unit);
    }
}

/// Lift flat units into the nested shape with empty embedded lists.
pub fn nest(flat: Vec<ContentUnit>) -> Vec<NestedUnit> {
    flat.into_iter().map(NestedUnit::from).collect()
}

/// Give every member of one album the same layout object.
pub fn assign_group_layout(
    units: &mut [ContentUnit],
    channel_id: &str,
    group: GroupKey,
    layout: Arc<Layout>,
) -> usize {
    let mut assigned = 0;
    for unit in units
        .iter_mut()
        .filter(|unit| unit.group() == Some((channel_id, group)))
    {
        unit.layout = Some(Arc::clone(&layout));
        assigned += 1;
    }
    assigned
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentGroup {
    pub parent: UnitId,
    pub comments: Vec<UnitId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct Threads {
    pub groups: Vec<CommentGroup>,
    /// Top-level units no comment points at.
    pub standalone: Vec<UnitId>,
}

pub fn group_by_parent(units: &[ContentUnit]) -> Threads {
    let mut groups: Vec<CommentGroup> = Vec::new();
    let mut slot: HashMap<UnitId, usize> = HashMap::new();

    for unit in units {
        let Some(parent) = unit.reply_to else {
            continue;
        };
        let index = *slot.entry(parent).or_insert_with(|| {
            groups.push(CommentGroup {
                parent,
                comments: Vec::new(),
            });
            groups.len() - 1
        });
        groups[index].comments.push(unit.id);
    }

    let standalone = units
        .iter()
        .filter(|unit| !unit.is_comment() && !slot.contains_key(&unit.id))
        .map(|unit| unit.id)
        .collect();

    Threads { groups, standalone }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct PageCounts {
    pub posts: usize,
    pub comments: usize,
    pub units: usize,
}

impl PageCounts {
    /// Posts count singles plus distinct albums; comments never count as posts.
    pub fn of(units: &[ContentUnit]) -> Self {
        let mut albums = HashSet::new();
        let mut singles = 0;
        let mut comments = 0;
        for unit in units {
            if unit.is_comment() {
                comments += 1;
            } else if let Some(key) = unit.group() {
                albums.insert(key);
            } else {
                singles += 1;
            }
        }
        Self {
            posts: singles + albums.len(),
            comments,
            units: units.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn unit(id: UnitId, channel: &str, reply_to: Option<UnitId>) -> ContentUnit {
        let mut unit = ContentUnit::new(id, channel, Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap());
        unit.reply_to = reply_to;
        unit
    }

    fn photo(id: UnitId, group: GroupKey) -> ContentUnit {
        let mut unit = unit(id, "chan", None);
        unit.grouped_id = Some(group);
        unit
    }

    fn ids(units: &[ContentUnit]) -> Vec<UnitId> {
        units.iter().map(|u| u.id).collect()
    }

    #[test]
    fn thread_scenario_keeps_order_and_groups_by_parent() {
        let units = vec![
            unit(100, "chan", None),
            unit(101, "chan", Some(100)),
            unit(102, "chan", Some(100)),
            unit(103, "chan", None),
        ];
        let flat = flatten(nest(units));
        assert_eq!(ids(&flat), vec![100, 101, 102, 103]);

        let threads = group_by_parent(&flat);
        assert_eq!(
            threads.groups,
            vec![CommentGroup {
                parent: 100,
                comments: vec![101, 102]
            }]
        );
        assert_eq!(threads.standalone, vec![103]);
    }

    #[test]
    fn albums_expand_and_share_the_parent_layout() {
        let layout = Arc::new(Layout {
            image_count: 2,
            ..Layout::default()
        });
        let mut head = photo(10, 5);
        head.layout = Some(layout.clone());
        let nested = vec![
            NestedUnit {
                unit: head,
                group_posts: vec![photo(10, 5), photo(11, 5)],
                comments: vec![unit(12, "discussion", Some(10))],
            },
            NestedUnit::from(unit(20, "chan", None)),
        ];

        let flat = flatten(nested);
        assert_eq!(ids(&flat), vec![10, 11, 12, 20]);
        assert!(Arc::ptr_eq(flat[0].layout.as_ref().unwrap(), &layout));
        assert!(Arc::ptr_eq(flat[1].layout.as_ref().unwrap(), &layout));
        assert_eq!(flat[2].channel_id, "discussion");
        assert_eq!(flat[2].reply_to, Some(10));
        assert!(flat[3].layout.is_none());
    }

    #[test]
    fn flatten_is_idempotent() {
        let nested = vec![NestedUnit {
            unit: photo(1, 9),
            group_posts: vec![photo(1, 9), photo(2, 9)],
            comments: vec![unit(3, "chat", Some(1))],
        }];
        let once = flatten(nested);
        let twice = flatten(nest(once.clone()));
        assert_eq!(once, twice);
    }

    #[test]
    fn layout_update_reaches_every_member() {
        let mut units = vec![photo(1, 9), photo(2, 9), photo(3, 8), unit(4, "chan", None)];
        let layout = Arc::new(Layout::default());
        assert_eq!(assign_group_layout(&mut units, "chan", 9, layout.clone()), 2);
        assert!(units[0].layout.is_some() && units[1].layout.is_some());
        assert!(units[2].layout.is_none());
        assert_eq!(assign_group_layout(&mut units, "other", 9, layout), 0);
    }

    #[test]
    fn counts_albums_once_and_skip_comments() {
        let units = vec![
            photo(1, 9),
            photo(2, 9),
            unit(3, "chan", None),
            unit(4, "chat", Some(3)),
        ];
        let counts = PageCounts::of(&units);
        assert_eq!(
            counts,
            PageCounts {
                posts: 2,
                comments: 1,
                units: 4
            }
        );
    }
}
