// Extraction strategies - independent ways of obtaining stream variants
//
// The resolver runs them strictly in order:
// - watch page, embed page, mobile page (HTML scraping)
// - player API (JSON endpoint)
// - subprocess delegate (yt-dlp), the last resort
//
// Diagnostics classify upstream failures for provenance and retry decisions.

pub mod delegate;
pub mod diagnostics;
pub mod page;
pub mod player_api;
mod traits;

pub use delegate::YtDlpDelegate;
pub use diagnostics::{detect_bot_wall, diagnose_error, BlockingReason};
pub use page::{PageKind, PageStrategy};
pub use player_api::{ApiClient, PlayerApiStrategy};
pub use traits::{ExtractionStrategy, WATCH_HOST};
