//! LinkedIn rules
//!
//! LinkedIn redirects suspicious logins to `/checkpoint/` pages, often right
//! after a login form submission that otherwise looked successful. The web
//! composer offers no scheduling.

use super::PlatformRules;
use crate::types::Platform;

pub const RULES: PlatformRules = PlatformRules {
    platform: Platform::LinkedIn,
    home_url: "https://www.linkedin.com/feed/",
    char_limit: 3000,
    max_media: 9,
    max_hashtags: 30,
    requires_media: false,
    supports_native_schedule: false,
    session_cookie: "li_at",
    challenge_markers: &["/checkpoint/", "challenge", "captcha"],
};
