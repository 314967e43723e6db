//! YouTube rules (community posts and uploads)

use super::PlatformRules;
use crate::types::Platform;

pub const RULES: PlatformRules = PlatformRules {
    platform: Platform::YouTube,
    home_url: "https://studio.youtube.com/",
    char_limit: 5000,
    max_media: 1,
    max_hashtags: 15,
    requires_media: false,
    supports_native_schedule: true,
    session_cookie: "SID",
    challenge_markers: &["/signin/v2/challenge", "/challenge/", "captcha", "speedbump"],
};
