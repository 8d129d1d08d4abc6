use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::debug;
use serde::Serialize;

use crate::client::{Client, ClientConfig};
use crate::config;
use crate::data::{ChannelService, HttpChannelService};
use crate::flatten::PageCounts;
use crate::model::ContentUnit;
use crate::navigator::{Cursor, Navigator, NavigatorOptions, Page};
use crate::notify::{AlertState, Notice};
use crate::settings::{EffectiveSettings, Source, ViewQuery};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub channel_id: String,
    pub query: Option<String>,
    pub config_file: Option<PathBuf>,
}

/// What the binary prints for one page.
#[derive(Debug, Serialize)]
pub struct PageReport<'a> {
    pub channel_id: &'a str,
    pub settings: EffectiveSettings,
    pub source: Source,
    pub can_save_view: bool,
    pub cursor: Cursor,
    pub counts: PageCounts,
    pub units: Vec<&'a ContentUnit>,
    pub notices: Vec<Notice>,
}

impl<'a> PageReport<'a> {
    pub fn new(page: &'a Page, notices: Vec<Notice>) -> Self {
        Self {
            channel_id: &page.target.channel_id,
            settings: page.settings,
            source: page.settings.source(),
            can_save_view: page.settings.can_save_view(),
            cursor: page.cursor,
            counts: page.counts,
            units: page.visible_units().collect(),
            notices,
        }
    }
}

pub async fn run(options: RunOptions) -> Result<()> {
    anyhow::ensure!(
        !options.channel_id.trim().is_empty(),
        "app: channel id is required"
    );
    let cfg = config::load(config::LoadOptions {
        config_file: options.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    debug!("app: backend {}", cfg.backend.base_url);

    let client = Client::new(ClientConfig {
        user_agent: cfg.backend.user_agent.clone(),
        base_url: Some(cfg.backend.base_url.clone()),
        timeout: Some(cfg.backend.timeout),
        http_client: None,
    })
    .context("app: build backend client")?;
    let service: Arc<dyn ChannelService> = Arc::new(HttpChannelService::new(Arc::new(client)));

    let alerts = Arc::new(AlertState::new());
    alerts.initialize();
    let navigator = Navigator::new(
        service,
        options.channel_id.trim(),
        NavigatorOptions {
            defaults: cfg.display.defaults(),
            overlay_concurrency: cfg.overlay.concurrency,
            notifier: alerts.clone(),
        },
    );
    navigator.apply_query(ViewQuery::parse(options.query.as_deref().unwrap_or_default()));

    let result = navigator.load().await;
    let notices = alerts.drain();
    alerts.reset();
    result.context("app: load page")?;

    let page = navigator
        .current_page()
        .context("app: no page was loaded")?;
    let report = PageReport::new(&page, notices);
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("app: encode page")?
    );
    Ok(())
}
