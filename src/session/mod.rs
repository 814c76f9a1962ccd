pub mod cdp;
pub mod challenge;
pub mod controller;
pub mod page;
pub mod presence;
pub mod stealth;

pub use challenge::{ChallengeKind, ChallengeStatus, Resolution};
pub use controller::{BrowserLauncher, ChromeLauncher, LaunchedBrowser, Session, SessionController};
pub use page::{eval_as, Page, PageHandle};
