use crate::model::{ContentUnit, MediaDescriptor, DOCUMENT_MEDIA_TYPE, WEB_PAGE_MEDIA_TYPE};

/// Media the offline reader cannot show: link previews, non-image
/// documents and webp stickers. Units without a media URL are never hidden.
pub fn should_hide_media(media: &MediaDescriptor) -> bool {
    let Some(url) = media.url.as_deref() else {
        return false;
    };
    if media.kind == WEB_PAGE_MEDIA_TYPE {
        return true;
    }
    if media.kind == DOCUMENT_MEDIA_TYPE {
        let is_image = media
            .mime
            .as_deref()
            .map(|mime| mime.starts_with("image/"))
            .unwrap_or(false);
        if !is_image {
            return true;
        }
    }
    url.to_ascii_lowercase().ends_with(".webp")
}

/// A unit is dropped from the page when it is hidden, or when its only
/// content is media that gets hidden.
pub fn should_hide_unit(unit: &ContentUnit) -> bool {
    if unit.is_hidden {
        return true;
    }
    let media_hidden = unit.media.as_ref().map(should_hide_media).unwrap_or(false);
    let text_empty = unit
        .message
        .as_deref()
        .map(|text| text.trim().is_empty())
        .unwrap_or(true);
    media_hidden && text_empty
}
