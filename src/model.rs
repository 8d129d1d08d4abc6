use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::settings::PartialSettings;

pub type UnitId = i64;
pub type ChannelId = String;
pub type GroupKey = i64;

pub const PHOTO_MEDIA_TYPE: &str = "MessageMediaPhoto";
pub const DOCUMENT_MEDIA_TYPE: &str = "MessageMediaDocument";
pub const WEB_PAGE_MEDIA_TYPE: &str = "MessageMediaWebPage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }

    pub fn reversed(self) -> Self {
        match self {
            SortOrder::Asc => SortOrder::Desc,
            SortOrder::Desc => SortOrder::Asc,
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MediaDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub thumb_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Author {
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

/// Generated gallery layout for one album. Cells index into the album's
/// photos in identity order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Layout {
    #[serde(default)]
    pub total_width: f64,
    #[serde(default)]
    pub total_height: f64,
    #[serde(default)]
    pub image_count: usize,
    #[serde(default)]
    pub cells: Vec<LayoutCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LayoutCell {
    pub image_index: usize,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// The atomic item of the stream: a post, a comment, or one photo of an album.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentUnit {
    pub id: UnitId,
    pub channel_id: ChannelId,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub reply_to: Option<UnitId>,
    #[serde(default)]
    pub grouped_id: Option<GroupKey>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub media: Option<MediaDescriptor>,
    #[serde(default)]
    pub author: Option<Author>,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default)]
    pub layout: Option<Arc<Layout>>,
}

impl ContentUnit {
    pub fn new(id: UnitId, channel_id: impl Into<ChannelId>, date: DateTime<Utc>) -> Self {
        Self {
            id,
            channel_id: channel_id.into(),
            date,
            reply_to: None,
            grouped_id: None,
            message: None,
            media: None,
            author: None,
            is_hidden: false,
            layout: None,
        }
    }

    pub fn is_comment(&self) -> bool {
        self.reply_to.is_some()
    }

    pub fn is_photo(&self) -> bool {
        self.media
            .as_ref()
            .map(|media| media.kind == PHOTO_MEDIA_TYPE)
            .unwrap_or(false)
    }

    /// Album key of a unit, if it belongs to one.
    pub fn group(&self) -> Option<(&str, GroupKey)> {
        self.grouped_id
            .map(|group| (self.channel_id.as_str(), group))
    }
}

/// A unit as the nested API shape delivers it: posts carry their album
/// members and their comments inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedUnit {
    #[serde(flatten)]
    pub unit: ContentUnit,
    #[serde(default)]
    pub group_posts: Vec<ContentUnit>,
    #[serde(default)]
    pub comments: Vec<ContentUnit>,
}

impl From<ContentUnit> for NestedUnit {
    fn from(unit: ContentUnit) -> Self {
        Self {
            unit,
            group_posts: Vec::new(),
            comments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub discussion_group_id: Option<ChannelId>,
    #[serde(default)]
    pub settings: PartialSettings,
}

impl ChannelInfo {
    pub fn new(id: impl Into<ChannelId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            discussion_group_id: None,
            settings: PartialSettings::default(),
        }
    }
}
