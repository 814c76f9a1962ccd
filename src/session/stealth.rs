use crate::config::schema::BrowserConfig;
use crate::error::Result;
use crate::session::page::Page;

/// Runs before page scripts on every document: hides the webdriver flag and
/// fills in the properties headless/automated Chrome leaves empty.
pub const STEALTH_SCRIPT: &str = r#"/*cp:stealth*/
(() => {
  Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
  Object.defineProperty(navigator, 'plugins', {
    get: () => [
      { name: 'PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
      { name: 'Chrome PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
      { name: 'Chromium PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
    ],
  });
  Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
  if (!window.chrome) {
    window.chrome = { runtime: {}, loadTimes: () => ({}), csi: () => ({}) };
  }
  const query = window.navigator.permissions && window.navigator.permissions.query;
  if (query) {
    window.navigator.permissions.query = (parameters) =>
      parameters && parameters.name === 'notifications'
        ? Promise.resolve({ state: Notification.permission })
        : query.call(window.navigator.permissions, parameters);
  }
})();
"#;

/// Install the fingerprint countermeasures on a freshly launched page.
pub async fn apply(page: &dyn Page, config: &BrowserConfig) -> Result<()> {
    page.add_init_script(STEALTH_SCRIPT).await?;
    let accept_language = format!("{},en;q=0.9", config.lang);
    page.set_user_agent(&config.user_agent, &accept_language)
        .await?;
    // The current document predates the init script
    page.evaluate(STEALTH_SCRIPT).await?;
    tracing::debug!("Stealth countermeasures installed");
    Ok(())
}
