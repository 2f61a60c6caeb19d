use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

use formpilot::config::FlowConfig;
use formpilot::page::TabId;
use formpilot::webdriver::{BrowserType, WebDriverBrowser};

/// `~/.formpilot`
pub fn formpilot_dir() -> Result<PathBuf> {
    let home_dir = dirs::home_dir().context("Unable to determine home directory")?;
    Ok(home_dir.join(".formpilot"))
}

/// Where resolved answers persist between runs
pub fn cache_path() -> Result<PathBuf> {
    Ok(formpilot_dir()?.join("cache.json"))
}

/// Load the configuration and apply command-line overrides
pub fn load_config(
    path: Option<&Path>,
    service_url: Option<String>,
    context: Option<String>,
) -> Result<FlowConfig> {
    let mut config = FlowConfig::load(path)?;
    if let Some(url) = service_url {
        config.service_url = url;
    }
    if context.is_some() {
        config.context = context;
    }
    config.validate()?;
    Ok(config)
}

/// Connect to WebDriver and open `url` in the session's first tab
pub async fn open_browser(
    browser: &str,
    webdriver_url: Option<&str>,
    no_headless: bool,
    url: &str,
) -> Result<(WebDriverBrowser, TabId)> {
    let browser_type: BrowserType = browser.parse()?;
    let browser = WebDriverBrowser::connect(browser_type, webdriver_url, !no_headless).await?;
    let primary = browser.primary_tab().await?;
    debug!("Primary tab is {}", primary);
    browser.goto(&primary, url).await?;
    Ok((browser, primary))
}
