use crate::config::schema::BrowserConfig;
use std::process::Command;

/// Build the Chrome command line for the automation session.
///
/// The page is driven over the DevTools port; `--enable-automation` is never
/// passed and the AutomationControlled blink feature is disabled so the page
/// does not see the usual automation markers.
pub fn build_command(config: &BrowserConfig, cdp_port: u16) -> Command {
    let mut cmd = Command::new(&config.chrome_path);

    cmd.arg(format!("--user-data-dir={}", config.profile_dir.display()));
    cmd.arg(format!("--remote-debugging-port={}", cdp_port));
    cmd.arg(format!(
        "--window-size={},{}",
        config.window_width, config.window_height
    ));
    cmd.arg(format!("--lang={}", config.lang));

    cmd.arg("--no-first-run");
    cmd.arg("--no-default-browser-check");
    cmd.arg("--disable-blink-features=AutomationControlled");
    cmd.arg("--disable-background-timer-throttling");
    cmd.arg("--disable-renderer-backgrounding");

    if config.headless {
        cmd.arg("--headless=new");
        cmd.arg("--disable-gpu");
    }

    for arg in &config.custom_args {
        cmd.arg(arg);
    }

    cmd.arg("about:blank");

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group so terminal signals reach us, not Chrome; we kill it on close.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|s| s.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_build_command_basic() {
        let config = BrowserConfig {
            profile_dir: PathBuf::from("/tmp/chatpilot-profile"),
            ..BrowserConfig::default()
        };

        let args = args_of(&build_command(&config, 9333));

        assert!(args.contains(&"--user-data-dir=/tmp/chatpilot-profile".to_string()));
        assert!(args.contains(&"--remote-debugging-port=9333".to_string()));
        assert!(args.contains(&"--window-size=1400,900".to_string()));
        assert!(args.contains(&"--lang=en-US".to_string()));
        assert!(!args.iter().any(|a| a == "--enable-automation"));
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));
    }

    #[test]
    fn test_build_command_headless_and_custom_args() {
        let config = BrowserConfig {
            headless: true,
            custom_args: vec!["--proxy-server=http://127.0.0.1:8889".to_string()],
            ..BrowserConfig::default()
        };

        let args = args_of(&build_command(&config, 9222));

        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--proxy-server=http://127.0.0.1:8889".to_string()));
    }
}
