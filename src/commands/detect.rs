use anyhow::Result;
use tracing::{debug, info};

use crate::commands::utils;
use formpilot::extractor::PageModelExtractor;
use formpilot::page::BrowserSession;

pub async fn handle_detect(
    url: String,
    browser: String,
    webdriver_url: Option<String>,
    no_headless: bool,
) -> Result<()> {
    info!("Detecting questions on {}", url);
    let (browser, primary) =
        utils::open_browser(&browser, webdriver_url.as_deref(), no_headless, &url).await?;

    let detected = async {
        let page = browser.page(&primary).await?;
        PageModelExtractor::new().detect(page.as_ref()).await
    }
    .await;
    if let Err(e) = browser.close().await {
        debug!("Failed to close browser: {}", e);
    }

    println!("{}", serde_json::to_string_pretty(&detected?)?);
    Ok(())
}
