use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::SortOrder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Default,
    Saved,
    Url,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Default => "default",
            Source::Saved => "saved",
            Source::Url => "url",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resolved<T> {
    pub value: T,
    pub source: Source,
}

/// One configuration layer. Used for both the request-scoped override and
/// the persisted per-channel settings; `None` means "not defined here".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct PartialSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<SortOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_per_chunk: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overflow_threshold: Option<f64>,
}

impl PartialSettings {
    pub fn is_empty(&self) -> bool {
        self.sort_order.is_none()
            && self.items_per_chunk.is_none()
            && self.overflow_threshold.is_none()
    }

    /// Layer `other` on top of `self`; fields defined in `other` win.
    pub fn merged(self, other: PartialSettings) -> PartialSettings {
        PartialSettings {
            sort_order: other.sort_order.or(self.sort_order),
            items_per_chunk: other.items_per_chunk.or(self.items_per_chunk),
            overflow_threshold: other.overflow_threshold.or(self.overflow_threshold),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    pub sort_order: SortOrder,
    pub items_per_chunk: usize,
    pub overflow_threshold: f64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            sort_order: SortOrder::Desc,
            items_per_chunk: 50,
            overflow_threshold: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectiveSettings {
    pub sort_order: Resolved<SortOrder>,
    pub items_per_chunk: Resolved<usize>,
    pub overflow_threshold: Resolved<f64>,
}

impl EffectiveSettings {
    /// Aggregate source: `url` if any field is URL-driven, else `saved` if
    /// any field came from saved settings, else `default`.
    pub fn source(&self) -> Source {
        self.sort_order
            .source
            .max(self.items_per_chunk.source)
            .max(self.overflow_threshold.source)
    }

    /// Whether the view differs from the saved preference by a URL override,
    /// i.e. whether offering "save this view" makes sense.
    pub fn can_save_view(&self) -> bool {
        self.source() == Source::Url
    }

    pub fn validate(&self) -> Result<(), Error> {
        validate_chunking(self.items_per_chunk.value, self.overflow_threshold.value)
    }

    /// The resolved values as a fully-defined layer, ready to persist.
    pub fn to_partial(&self) -> PartialSettings {
        PartialSettings {
            sort_order: Some(self.sort_order.value),
            items_per_chunk: Some(self.items_per_chunk.value),
            overflow_threshold: Some(self.overflow_threshold.value),
        }
    }
}

pub fn validate_chunking(items_per_chunk: usize, overflow_threshold: f64) -> Result<(), Error> {
    if items_per_chunk == 0 {
        return Err(Error::InvalidConfiguration(
            "items_per_chunk must be positive".into(),
        ));
    }
    if !(0.0..1.0).contains(&overflow_threshold) {
        return Err(Error::InvalidConfiguration(format!(
            "overflow_threshold must be in [0, 1), got {overflow_threshold}"
        )));
    }
    Ok(())
}

/// Resolve every field with strict priority: request override, then saved
/// per-channel setting, then the hard default. Pure; never fetches.
pub fn resolve(
    url: &PartialSettings,
    saved: &PartialSettings,
    defaults: &Defaults,
) -> EffectiveSettings {
    EffectiveSettings {
        sort_order: pick(url.sort_order, saved.sort_order, defaults.sort_order),
        items_per_chunk: pick(
            url.items_per_chunk,
            saved.items_per_chunk,
            defaults.items_per_chunk,
        ),
        overflow_threshold: pick(
            url.overflow_threshold,
            saved.overflow_threshold,
            defaults.overflow_threshold,
        ),
    }
}

fn pick<T>(url: Option<T>, saved: Option<T>, default: T) -> Resolved<T> {
    if let Some(value) = url {
        return Resolved {
            value,
            source: Source::Url,
        };
    }
    if let Some(value) = saved {
        return Resolved {
            value,
            source: Source::Saved,
        };
    }
    Resolved {
        value: default,
        source: Source::Default,
    }
}

/// The request-scoped part of a view: the override layer plus the
/// requested chunk (`None` = unpaginated).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewQuery {
    pub settings: PartialSettings,
    pub chunk: Option<usize>,
}

impl ViewQuery {
    /// Parse a URL query string. Values that do not parse are dropped so the
    /// cascade falls through to the saved and default layers.
    pub fn parse(query: &str) -> Self {
        let mut view = ViewQuery::default();
        let query = query.trim_start_matches('?');
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = value.trim();
            match key.as_ref() {
                "sort_order" => match value.parse::<SortOrder>() {
                    Ok(order) => view.settings.sort_order = Some(order),
                    Err(err) => warn!("query: ignoring sort_order: {err}"),
                },
                "items_per_chunk" => match value.parse::<usize>() {
                    Ok(n) if n > 0 => view.settings.items_per_chunk = Some(n),
                    _ => warn!("query: ignoring items_per_chunk={value:?}"),
                },
                "overflow_threshold" => match value.parse::<f64>() {
                    Ok(t) if (0.0..1.0).contains(&t) => view.settings.overflow_threshold = Some(t),
                    _ => warn!("query: ignoring overflow_threshold={value:?}"),
                },
                "chunk" => match value.parse::<usize>() {
                    Ok(index) => view.chunk = Some(index),
                    Err(_) => warn!("query: ignoring chunk={value:?}"),
                },
                _ => {}
            }
        }
        view
    }
}
